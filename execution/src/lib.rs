// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of build plans against a pluggable infrastructure builder.
//!
//! The [`Orchestrator`] is the top-level entry point: it plans a build,
//! gates it on the approval workflow, and drives concurrent execution,
//! rebuild, and teardown.  See the planner crate for how plans come to
//! exist and the types crate for the DAG itself.

pub mod approval;
pub mod builder;
mod executor;
mod rebuild;
mod signals;

pub use approval::AutoApprover;
pub use approval::CommitReviewer;
pub use approval::ReviewDecision;
pub use builder::Builder;
pub use builder::BuilderError;
pub use builder::BuilderOp;
pub use executor::ExecutionSummary;
pub use executor::PlanExecutor;

use rampart_common::Error;
use rampart_datastore::Datastore;
use rampart_datastore::StatusTracker;
use rampart_planner::BuildPlanner;
use rampart_planner::PlanError;
use rampart_planner::PlannerConfig;
use rampart_planner::StepRenderer;
use rampart_types::build::Build;
use rampart_types::build::BuildCommit;
use rampart_types::build::CommitState;
use rampart_types::environment::Environment;
use rampart_types::events::BusEvent;
use rampart_types::events::NotificationBus;
use rampart_types::status::EntityRef;
use rampart_types::status::ProvisionState;
use rampart_types::BuildUuid;
use rampart_types::CommitUuid;
use rampart_types::PlanUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on concurrent builder calls.
pub const DEFAULT_BUILDER_PARALLELISM: usize = 16;

/// Errors from orchestration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("planning failed")]
    Plan(#[from] PlanError),
    #[error("commit {commit} was rejected by review")]
    CommitRejected { commit: CommitUuid },
    #[error("timed out waiting for review of commit {commit}")]
    CommitTimedOut { commit: CommitUuid },
    #[error("execution task aborted: {message}")]
    TaskAborted { message: String },
    #[error(transparent)]
    Datastore(#[from] Error),
}

/// Orchestrator knobs, threaded explicitly through construction.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Hard bound on how long a build commit may sit in review.
    #[serde(default = "OrchestratorConfig::default_approval_timeout")]
    pub approval_timeout: Duration,
    /// Maximum concurrent builder calls per dispatch round.
    #[serde(default = "OrchestratorConfig::default_builder_parallelism")]
    pub builder_parallelism: usize,
    /// Planning-time settings, forwarded to the planner.
    #[serde(default)]
    pub planner: PlannerConfig,
}

impl OrchestratorConfig {
    fn default_approval_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_builder_parallelism() -> usize {
        DEFAULT_BUILDER_PARALLELISM
    }
}

impl Default for OrchestratorConfig {
    fn default() -> OrchestratorConfig {
        OrchestratorConfig {
            approval_timeout: Self::default_approval_timeout(),
            builder_parallelism: Self::default_builder_parallelism(),
            planner: PlannerConfig::default(),
        }
    }
}

/// The result of a successful `create_build`.
#[derive(Clone, Debug)]
pub struct BuildOutcome {
    pub build: Build,
    pub commit: BuildCommit,
    pub summary: ExecutionSummary,
}

/// Top-level entry point tying planner, approval workflow, and
/// executor together.
pub struct Orchestrator {
    datastore: Arc<dyn Datastore>,
    tracker: StatusTracker,
    bus: Arc<dyn NotificationBus>,
    planner: BuildPlanner,
    executor: PlanExecutor,
    reviewer: Arc<dyn CommitReviewer>,
    config: OrchestratorConfig,
    log: Logger,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        datastore: Arc<dyn Datastore>,
        bus: Arc<dyn NotificationBus>,
        builder: Arc<dyn Builder>,
        reviewer: Arc<dyn CommitReviewer>,
        renderer: Arc<dyn StepRenderer>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        let tracker = StatusTracker::new(
            log,
            Arc::clone(&datastore),
            Arc::clone(&bus),
        );
        let planner = BuildPlanner::new(
            log,
            Arc::clone(&datastore),
            tracker.clone(),
            Arc::clone(&bus),
            renderer,
            config.planner,
        );
        let executor = PlanExecutor::new(
            log,
            Arc::clone(&datastore),
            tracker.clone(),
            builder,
            config.builder_parallelism,
        );
        Orchestrator {
            datastore,
            tracker,
            bus,
            planner,
            executor,
            reviewer,
            config,
            log: log.new(o!("component" => "Orchestrator")),
        }
    }

    /// Plans a build of `environment`, submits its commit for review,
    /// and (if approved in time) executes the plan.
    ///
    /// A rejected or timed-out commit is marked cancelled; nothing is
    /// dispatched for it, but the planned rows stay around for
    /// inspection and a later delete.
    pub async fn create_build(
        &self,
        environment: &Environment,
    ) -> Result<BuildOutcome, ExecError> {
        let planned = self.planner.plan_build(environment).await?;
        let build = planned.build;
        let commit = planned.commit;

        let review = tokio::time::timeout(
            self.config.approval_timeout,
            self.reviewer.wait_for_review(&commit),
        )
        .await;
        let decision = match review {
            Ok(Ok(decision)) => decision,
            Ok(Err(error)) => {
                self.cancel_commit(&commit).await?;
                return Err(ExecError::Datastore(error));
            }
            Err(_elapsed) => {
                warn!(
                    self.log, "commit review timed out";
                    "commit_id" => %commit.id,
                    "timeout" => ?self.config.approval_timeout,
                );
                self.cancel_commit(&commit).await?;
                return Err(ExecError::CommitTimedOut {
                    commit: commit.id,
                });
            }
        };
        if decision == ReviewDecision::Rejected {
            self.cancel_commit(&commit).await?;
            return Err(ExecError::CommitRejected { commit: commit.id });
        }

        let commit = self
            .datastore
            .commit_set_state(commit.id, CommitState::Approved)
            .await?;
        self.publish_commit(&commit);
        info!(
            self.log, "commit approved; dispatching build";
            "build_id" => %build.id,
            "commit_id" => %commit.id,
        );

        self.tracker
            .transition(
                &EntityRef::build(build.id),
                ProvisionState::Awaiting,
            )
            .await?;
        let nodes = self.datastore.plans_for_build(build.id).await?;
        let summary = self.executor.execute_nodes(nodes).await?;
        if summary.all_complete() {
            self.tracker
                .transition(
                    &EntityRef::build(build.id),
                    ProvisionState::Complete,
                )
                .await?;
        } else {
            self.tracker
                .fail(
                    &EntityRef::build(build.id),
                    format!(
                        "{} nodes failed, {} blocked",
                        summary.failed, summary.blocked
                    ),
                )
                .await?;
        }
        self.bus.publish(BusEvent::BuildUpdated { build: build.id });
        Ok(BuildOutcome { build, commit, summary })
    }

    /// Tears down and re-executes everything reachable from `start`.
    pub async fn rebuild(
        &self,
        start: &[PlanUuid],
    ) -> Result<ExecutionSummary, ExecError> {
        let summary = self.executor.rebuild(start).await?;
        if let Some(first) = start.first() {
            match self.datastore.plan_get(*first).await {
                Ok(node) => self.bus.publish(BusEvent::BuildUpdated {
                    build: node.build_id,
                }),
                Err(error) => warn!(
                    self.log, "rebuilt node no longer present";
                    "plan_id" => %first,
                    "error" => %error,
                ),
            }
        }
        Ok(summary)
    }

    /// Tears down and removes an entire build.
    pub async fn delete_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<(), ExecError> {
        self.executor.delete_build(build_id).await?;
        self.bus.publish(BusEvent::BuildUpdated { build: build_id });
        Ok(())
    }

    async fn cancel_commit(
        &self,
        commit: &BuildCommit,
    ) -> Result<(), Error> {
        let cancelled = self
            .datastore
            .commit_set_state(commit.id, CommitState::Cancelled)
            .await?;
        self.publish_commit(&cancelled);
        info!(
            self.log, "commit cancelled";
            "commit_id" => %commit.id,
            "build_id" => %commit.build_id,
        );
        Ok(())
    }

    fn publish_commit(&self, commit: &BuildCommit) {
        self.bus.publish(BusEvent::CommitStateChanged {
            commit: commit.id,
            build: commit.build_id,
            state: commit.state,
        });
    }
}
