// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node completion signals.
//!
//! There is no scheduler loop: every node's task simply waits on its
//! predecessors' watch channels and resolves its own when it settles.
//! The producer side is resolved exactly once on every exit path, so a
//! waiter can never hang on a task that already finished.

use rampart_types::PlanUuid;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// How one node's action ended, as seen by its successors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeDisposition {
    /// Not settled yet.
    Pending,
    Succeeded,
    Failed,
    Blocked,
    TornDown,
}

/// One watch channel per plan node participating in a dispatch round.
pub(crate) struct SignalSet {
    senders: BTreeMap<PlanUuid, watch::Sender<NodeDisposition>>,
}

impl SignalSet {
    pub(crate) fn new(
        ids: impl IntoIterator<Item = PlanUuid>,
    ) -> SignalSet {
        let senders = ids
            .into_iter()
            .map(|id| {
                let (tx, _rx) = watch::channel(NodeDisposition::Pending);
                (id, tx)
            })
            .collect();
        SignalSet { senders }
    }

    /// A receiver for `id`'s signal, if `id` is part of this round.
    pub(crate) fn subscribe(
        &self,
        id: PlanUuid,
    ) -> Option<watch::Receiver<NodeDisposition>> {
        self.senders.get(&id).map(|tx| tx.subscribe())
    }

    /// Settles `id`.  Later resolutions of the same node are ignored;
    /// the first disposition wins.
    pub(crate) fn resolve(&self, id: PlanUuid, disposition: NodeDisposition) {
        if let Some(tx) = self.senders.get(&id) {
            tx.send_if_modified(|current| {
                if *current == NodeDisposition::Pending {
                    *current = disposition;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Waits until the watched node settles.
    ///
    /// A dropped sender counts as `Failed`; that only happens if the
    /// producing task was torn down without resolving.
    pub(crate) async fn settled(
        mut rx: watch::Receiver<NodeDisposition>,
    ) -> NodeDisposition {
        match rx.wait_for(|d| *d != NodeDisposition::Pending).await {
            Ok(guard) => *guard,
            Err(_) => NodeDisposition::Failed,
        }
    }
}
