// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Marking, tearing down, and re-executing plan subgraphs.
//!
//! Rebuild runs in four phases: a synchronous forward traversal marks
//! the affected subgraph `ToDelete`; concurrent teardown tasks destroy
//! infrastructure in reverse dependency order (each node waits for its
//! successors to report torn down); a second traversal resets the set
//! to `Planning`; and the ordinary executor re-dispatches it.  Delete
//! stops after teardown and drops the rows.

use crate::ExecError;
use crate::builder::BuilderError;
use crate::executor::ExecutionSummary;
use crate::executor::PlanExecutor;
use crate::signals::NodeDisposition;
use crate::signals::SignalSet;
use rampart_common::Error;
use rampart_types::plan::PlanNode;
use rampart_types::plan::PlanPayload;
use rampart_types::plan::PlanType;
use rampart_types::status::EntityRef;
use rampart_types::status::ProvisionState;
use rampart_types::BuildUuid;
use rampart_types::PlanUuid;
use slog::info;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;

impl PlanExecutor {
    /// Phase 1 of rebuild/delete: forward DFS over `next` edges from
    /// `start`, marking every reachable node (and its payload entity)
    /// `ToDelete`.  Pure state mutation, deliberately sequential.
    ///
    /// Returns the affected nodes.  Nodes already mid-dispatch
    /// (`Awaiting`) cannot be marked and fail the traversal.
    pub async fn mark_for_delete(
        &self,
        start: &[PlanUuid],
    ) -> Result<Vec<PlanNode>, ExecError> {
        let mut visited: BTreeSet<PlanUuid> = BTreeSet::new();
        let mut stack: Vec<PlanUuid> = start.to_vec();
        let mut affected = Vec::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.datastore.plan_get(id).await?;
            self.transition_node(&node, ProvisionState::ToDelete)
                .await
                .map_err(ExecError::Datastore)?;
            stack.extend(node.next.iter().copied());
            affected.push(node);
        }
        info!(
            self.log, "marked subgraph for delete";
            "start_count" => start.len(),
            "affected_count" => affected.len(),
        );
        Ok(affected)
    }

    /// Phase 2: concurrent teardown of `nodes`.  Each task waits until
    /// every successor has torn down before destroying its own
    /// infrastructure, so hosts go before their networks and steps
    /// before their hosts.  A failed destroy is recorded on the node's
    /// status but does not stop the rest of the teardown.
    pub(crate) async fn teardown_nodes(
        &self,
        nodes: Vec<PlanNode>,
    ) -> Result<(), ExecError> {
        let signals = Arc::new(SignalSet::new(
            nodes.iter().map(|n| n.id),
        ));
        let mut tasks = JoinSet::new();
        for node in nodes {
            let executor = self.clone();
            let signals = Arc::clone(&signals);
            let next_signals: Vec<_> = node
                .next
                .iter()
                .filter_map(|n| signals.subscribe(*n))
                .collect();
            tasks.spawn(async move {
                let result =
                    executor.teardown_node(&node, next_signals).await;
                // Teardown always settles, even on failure: a stuck
                // predecessor would otherwise wait forever for us.
                signals.resolve(node.id, NodeDisposition::TornDown);
                result
            });
        }

        let mut first_error: Option<ExecError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    first_error
                        .get_or_insert(ExecError::Datastore(error));
                }
                Err(join_error) => {
                    first_error.get_or_insert(ExecError::TaskAborted {
                        message: join_error.to_string(),
                    });
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn teardown_node(
        &self,
        node: &PlanNode,
        next_signals: Vec<
            tokio::sync::watch::Receiver<NodeDisposition>,
        >,
    ) -> Result<(), Error> {
        for rx in next_signals {
            // The only disposition teardown rounds produce is
            // TornDown; any settlement means the successor is gone.
            let _ = SignalSet::settled(rx).await;
        }
        if let Err(builder_error) = self.destroy(node).await? {
            warn!(
                self.log, "teardown action failed";
                "plan_id" => %node.id,
                "error" => %InlineErrorChain::new(&builder_error),
            );
            self.tracker
                .annotate_error(
                    &EntityRef::plan_node(node.id),
                    builder_error.to_string(),
                )
                .await?;
        }
        Ok(())
    }

    /// The destroy action for `node`'s payload.  Milestone and step
    /// nodes have no infrastructure of their own.
    async fn destroy(
        &self,
        node: &PlanNode,
    ) -> Result<Result<(), BuilderError>, Error> {
        match node.payload {
            PlanPayload::Build(_)
            | PlanPayload::Team(_)
            | PlanPayload::Step(_) => Ok(Ok(())),
            PlanPayload::Network(id) => {
                let network = self.datastore.network_get(id).await?;
                Ok(self.builder.destroy_network(&network).await)
            }
            PlanPayload::Host(id) => {
                let host = self.datastore.host_get(id).await?;
                Ok(self.builder.destroy_host(&host).await)
            }
        }
    }

    /// Phase 3: reset the affected set to `Planning` so it can be
    /// dispatched again.
    async fn reset_for_rebuild(
        &self,
        affected: &[PlanNode],
    ) -> Result<(), ExecError> {
        for node in affected {
            self.transition_node(node, ProvisionState::Planning)
                .await
                .map_err(ExecError::Datastore)?;
        }
        Ok(())
    }

    /// Tears down everything reachable from `start` and builds it
    /// again.  Predecessors outside the affected set gate re-execution
    /// through their persisted status.
    pub async fn rebuild(
        &self,
        start: &[PlanUuid],
    ) -> Result<ExecutionSummary, ExecError> {
        let affected = self.mark_for_delete(start).await?;
        self.teardown_nodes(affected.clone()).await?;
        self.reset_for_rebuild(&affected).await?;

        // Re-read for fresh edge sets; planning rows are immutable but
        // this keeps the round working from persisted truth.
        let mut nodes = Vec::with_capacity(affected.len());
        for node in &affected {
            nodes.push(self.datastore.plan_get(node.id).await?);
        }
        self.execute_nodes(nodes).await
    }

    /// Tears down an entire build and removes it (and everything it
    /// owns) from the datastore.
    pub async fn delete_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<(), ExecError> {
        let plans = self.datastore.plans_for_build(build_id).await?;
        let root = plans
            .iter()
            .find(|p| p.plan_type() == PlanType::StartBuild)
            .ok_or_else(|| {
                Error::internal_error(format!(
                    "build {build_id} has no root plan node"
                ))
            })?;
        let affected = self.mark_for_delete(&[root.id]).await?;
        self.teardown_nodes(affected).await?;
        self.datastore.build_delete(build_id).await?;
        info!(self.log, "build deleted"; "build_id" => %build_id);
        Ok(())
    }
}
