// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The infrastructure-builder collaborator.
//!
//! Concrete builders (one per provider) turn provisioned rows into real
//! networks and hosts.  The executor only sees this trait.  Step
//! execution is included here as the dispatch target for step nodes;
//! in a real deployment the builder forwards it to the remote
//! provisioning agent.

use async_trait::async_trait;
use rampart_types::build::ProvisionedHost;
use rampart_types::build::ProvisionedNetwork;
use rampart_types::build::ProvisioningStep;
use uuid::Uuid;

/// One category of builder call, for error reporting and the simulated
/// builder's ledger.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum BuilderOp {
    DeployNetwork,
    DeployHost,
    ExecuteStep,
    DestroyHost,
    DestroyNetwork,
}

impl std::fmt::Display for BuilderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuilderOp::DeployNetwork => "deploy_network",
            BuilderOp::DeployHost => "deploy_host",
            BuilderOp::ExecuteStep => "execute_step",
            BuilderOp::DestroyHost => "destroy_host",
            BuilderOp::DestroyNetwork => "destroy_network",
        };
        f.write_str(s)
    }
}

/// Failure of a single builder call.  Recorded on the affected node
/// only; unrelated subtrees keep going.
#[derive(Clone, Debug, thiserror::Error)]
#[error("builder {op} failed for {target}: {message}")]
pub struct BuilderError {
    pub op: BuilderOp,
    pub target: Uuid,
    pub message: String,
}

/// Provider-specific materialization of provisioned rows.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn deploy_network(
        &self,
        network: &ProvisionedNetwork,
    ) -> Result<(), BuilderError>;

    async fn deploy_host(
        &self,
        host: &ProvisionedHost,
    ) -> Result<(), BuilderError>;

    async fn execute_step(
        &self,
        step: &ProvisioningStep,
    ) -> Result<(), BuilderError>;

    async fn destroy_host(
        &self,
        host: &ProvisionedHost,
    ) -> Result<(), BuilderError>;

    async fn destroy_network(
        &self,
        network: &ProvisionedNetwork,
    ) -> Result<(), BuilderError>;
}

pub mod sim {
    //! An in-process builder that deploys nothing and remembers
    //! everything, with failure injection for tests.

    use super::*;
    use slog::Logger;
    use slog::debug;
    use slog::o;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// One recorded builder call.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SimCall {
        pub op: BuilderOp,
        pub target: Uuid,
    }

    #[derive(Default)]
    struct SimState {
        calls: Vec<SimCall>,
        failures: BTreeSet<(BuilderOp, Uuid)>,
    }

    pub struct SimBuilder {
        state: Mutex<SimState>,
        log: Logger,
    }

    impl SimBuilder {
        pub fn new(log: &Logger) -> SimBuilder {
            SimBuilder {
                state: Mutex::new(SimState::default()),
                log: log.new(o!("component" => "SimBuilder")),
            }
        }

        /// Makes the next (and every) `op` against `target` fail.
        pub fn fail_on(&self, op: BuilderOp, target: Uuid) {
            self.state
                .lock()
                .unwrap()
                .failures
                .insert((op, target));
        }

        /// Every call recorded so far, in dispatch order.
        pub fn calls(&self) -> Vec<SimCall> {
            self.state.lock().unwrap().calls.clone()
        }

        fn record(
            &self,
            op: BuilderOp,
            target: Uuid,
        ) -> Result<(), BuilderError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(SimCall { op, target });
            debug!(self.log, "sim builder call";
                "op" => %op, "target" => %target);
            if state.failures.contains(&(op, target)) {
                return Err(BuilderError {
                    op,
                    target,
                    message: "injected failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Builder for SimBuilder {
        async fn deploy_network(
            &self,
            network: &ProvisionedNetwork,
        ) -> Result<(), BuilderError> {
            self.record(
                BuilderOp::DeployNetwork,
                network.id.into_untyped_uuid(),
            )
        }

        async fn deploy_host(
            &self,
            host: &ProvisionedHost,
        ) -> Result<(), BuilderError> {
            self.record(BuilderOp::DeployHost, host.id.into_untyped_uuid())
        }

        async fn execute_step(
            &self,
            step: &ProvisioningStep,
        ) -> Result<(), BuilderError> {
            self.record(BuilderOp::ExecuteStep, step.id.into_untyped_uuid())
        }

        async fn destroy_host(
            &self,
            host: &ProvisionedHost,
        ) -> Result<(), BuilderError> {
            self.record(BuilderOp::DestroyHost, host.id.into_untyped_uuid())
        }

        async fn destroy_network(
            &self,
            network: &ProvisionedNetwork,
        ) -> Result<(), BuilderError> {
            self.record(
                BuilderOp::DestroyNetwork,
                network.id.into_untyped_uuid(),
            )
        }
    }
}
