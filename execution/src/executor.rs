// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concurrent execution of a plan's nodes.
//!
//! One tokio task per node, a join barrier at the end, and no central
//! scheduler: ordering comes entirely from each task waiting on its
//! predecessors' completion signals before acting.  Builder calls are
//! additionally bounded by a semaphore so a wide plan cannot stampede
//! the provider.

use crate::ExecError;
use crate::builder::Builder;
use crate::builder::BuilderError;
use crate::signals::NodeDisposition;
use crate::signals::SignalSet;
use rampart_common::Error;
use rampart_datastore::Datastore;
use rampart_datastore::StatusTracker;
use rampart_types::plan::PlanNode;
use rampart_types::plan::PlanPayload;
use rampart_types::status::EntityRef;
use rampart_types::status::ProvisionState;
use rampart_types::PlanUuid;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome counts for one dispatch round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutionSummary {
    pub complete: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl ExecutionSummary {
    /// Whether every node's action succeeded.
    pub fn all_complete(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NodeOutcome {
    Complete,
    Failed,
    Blocked,
}

/// Drives plan nodes against the builder collaborator.
#[derive(Clone)]
pub struct PlanExecutor {
    pub(crate) datastore: Arc<dyn Datastore>,
    pub(crate) tracker: StatusTracker,
    pub(crate) builder: Arc<dyn Builder>,
    pub(crate) parallelism: usize,
    pub(crate) log: Logger,
}

impl PlanExecutor {
    pub fn new(
        log: &Logger,
        datastore: Arc<dyn Datastore>,
        tracker: StatusTracker,
        builder: Arc<dyn Builder>,
        parallelism: usize,
    ) -> PlanExecutor {
        PlanExecutor {
            datastore,
            tracker,
            builder,
            parallelism: parallelism.max(1),
            log: log.new(o!("component" => "PlanExecutor")),
        }
    }

    /// Dispatches every node in `nodes` concurrently, honoring `prev`
    /// ordering, and joins.  Predecessors outside `nodes` (possible
    /// when re-executing a subgraph) are checked once against their
    /// persisted status instead of waited on.
    pub async fn execute_nodes(
        &self,
        nodes: Vec<PlanNode>,
    ) -> Result<ExecutionSummary, ExecError> {
        let in_round: BTreeSet<PlanUuid> =
            nodes.iter().map(|n| n.id).collect();
        let signals =
            Arc::new(SignalSet::new(in_round.iter().copied()));
        let semaphore = Arc::new(Semaphore::new(self.parallelism));

        let mut tasks = JoinSet::new();
        for node in nodes {
            let executor = self.clone();
            let signals = Arc::clone(&signals);
            let semaphore = Arc::clone(&semaphore);
            let prev_signals: Vec<_> = node
                .prev
                .iter()
                .filter_map(|p| signals.subscribe(*p))
                .collect();
            let external_prev: Vec<PlanUuid> = node
                .prev
                .iter()
                .filter(|p| !in_round.contains(p))
                .copied()
                .collect();
            tasks.spawn(async move {
                let outcome = executor
                    .run_node(
                        &node,
                        prev_signals,
                        external_prev,
                        &semaphore,
                    )
                    .await;
                let disposition = match &outcome {
                    Ok(NodeOutcome::Complete) => {
                        NodeDisposition::Succeeded
                    }
                    Ok(NodeOutcome::Failed) | Err(_) => {
                        NodeDisposition::Failed
                    }
                    Ok(NodeOutcome::Blocked) => NodeDisposition::Blocked,
                };
                // Resolve on every exit path so successors never hang.
                signals.resolve(node.id, disposition);
                outcome
            });
        }

        let mut summary = ExecutionSummary::default();
        let mut first_error: Option<ExecError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(NodeOutcome::Complete)) => summary.complete += 1,
                Ok(Ok(NodeOutcome::Failed)) => summary.failed += 1,
                Ok(Ok(NodeOutcome::Blocked)) => summary.blocked += 1,
                Ok(Err(error)) => {
                    summary.failed += 1;
                    first_error
                        .get_or_insert(ExecError::Datastore(error));
                }
                Err(join_error) => {
                    summary.failed += 1;
                    first_error.get_or_insert(ExecError::TaskAborted {
                        message: join_error.to_string(),
                    });
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        info!(
            self.log, "dispatch round finished";
            "complete" => summary.complete,
            "failed" => summary.failed,
            "blocked" => summary.blocked,
        );
        Ok(summary)
    }

    async fn run_node(
        &self,
        node: &PlanNode,
        prev_signals: Vec<tokio::sync::watch::Receiver<NodeDisposition>>,
        external_prev: Vec<PlanUuid>,
        semaphore: &Semaphore,
    ) -> Result<NodeOutcome, Error> {
        self.transition_node(node, ProvisionState::Awaiting).await?;

        // Predecessors planned in an earlier round must already have
        // finished successfully.
        let mut blocked = false;
        for prev in external_prev {
            let status = self
                .datastore
                .status_get(&EntityRef::plan_node(prev))
                .await?;
            if status.state != ProvisionState::Complete {
                blocked = true;
            }
        }
        for rx in prev_signals {
            if blocked {
                break;
            }
            if SignalSet::settled(rx).await != NodeDisposition::Succeeded
            {
                blocked = true;
            }
        }

        if blocked {
            self.transition_node(node, ProvisionState::Blocked).await?;
            return Ok(NodeOutcome::Blocked);
        }

        let _permit = semaphore.acquire().await.map_err(|_| {
            Error::internal_error("builder semaphore closed")
        })?;
        match self.dispatch(node).await? {
            Ok(()) => {
                self.transition_node(node, ProvisionState::Complete)
                    .await?;
                Ok(NodeOutcome::Complete)
            }
            Err(builder_error) => {
                warn!(
                    self.log, "builder action failed";
                    "plan_id" => %node.id,
                    "error" => %InlineErrorChain::new(&builder_error),
                );
                self.fail_node(node, builder_error.to_string()).await?;
                Ok(NodeOutcome::Failed)
            }
        }
    }

    /// Invokes the builder action appropriate for `node`'s payload.
    /// The outer `Result` is a datastore failure; the inner one is the
    /// builder's verdict.
    async fn dispatch(
        &self,
        node: &PlanNode,
    ) -> Result<Result<(), BuilderError>, Error> {
        match node.payload {
            // Milestone nodes exist only to order their successors.
            PlanPayload::Build(_) | PlanPayload::Team(_) => Ok(Ok(())),
            PlanPayload::Network(id) => {
                let network = self.datastore.network_get(id).await?;
                Ok(self.builder.deploy_network(&network).await)
            }
            PlanPayload::Host(id) => {
                let host = self.datastore.host_get(id).await?;
                Ok(self.builder.deploy_host(&host).await)
            }
            PlanPayload::Step(id) => {
                let step = self.datastore.step_get(id).await?;
                Ok(self.builder.execute_step(&step).await)
            }
        }
    }

    /// Applies `state` to the node and, except for the build itself
    /// (whose status the orchestrator owns), mirrors it onto the
    /// payload entity.
    pub(crate) async fn transition_node(
        &self,
        node: &PlanNode,
        state: ProvisionState,
    ) -> Result<(), Error> {
        self.tracker
            .transition(&EntityRef::plan_node(node.id), state)
            .await?;
        if !matches!(node.payload, PlanPayload::Build(_)) {
            self.tracker
                .transition(&node.payload.entity(), state)
                .await?;
        }
        Ok(())
    }

    async fn fail_node(
        &self,
        node: &PlanNode,
        message: String,
    ) -> Result<(), Error> {
        self.tracker
            .fail(&EntityRef::plan_node(node.id), message.clone())
            .await?;
        if !matches!(node.payload, PlanPayload::Build(_)) {
            self.tracker.fail(&node.payload.entity(), message).await?;
        }
        Ok(())
    }
}
