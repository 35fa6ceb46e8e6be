// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concrete per-build entities.
//!
//! These are the rows planning materializes from an [`Environment`]:
//! one [`Build`], N [`Team`]s, and per team the provisioned networks,
//! hosts, and steps.  Everything here is immutable after creation except
//! the status row each entity owns and the host end-step back-reference,
//! which is set exactly once when the host's step chain is planned.
//!
//! [`Environment`]: crate::environment::Environment

use crate::environment::Environment;
use crate::environment::StepPayload;
use crate::environment::StepType;
use crate::typed_uuid::BuildUuid;
use crate::typed_uuid::CommitUuid;
use crate::typed_uuid::EnvironmentUuid;
use crate::typed_uuid::HostUuid;
use crate::typed_uuid::NetworkUuid;
use crate::typed_uuid::PlanUuid;
use crate::typed_uuid::StepUuid;
use crate::typed_uuid::TeamUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

/// One top-level request to materialize `team_count` copies of an
/// environment.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Build {
    pub id: BuildUuid,
    /// Count of builds previously planned for this environment.
    pub revision: u32,
    pub environment_id: EnvironmentUuid,
    /// The environment revision this build was planned from.
    pub environment_revision: u32,
    pub team_count: u32,
}

impl Build {
    pub fn new(environment: &Environment, revision: u32) -> Build {
        Build {
            id: BuildUuid::new_v4(),
            revision,
            environment_id: environment.id,
            environment_revision: environment.revision,
            team_count: environment.team_count,
        }
    }
}

/// One isolated instance of the environment's networks and hosts.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Team {
    pub id: TeamUuid,
    pub build_id: BuildUuid,
    /// 0-based; teams are numbered `0..team_count`.
    pub team_number: u32,
}

impl Team {
    pub fn new(build: &Build, team_number: u32) -> Team {
        Team { id: TeamUuid::new_v4(), build_id: build.id, team_number }
    }
}

/// The team-specific instantiation of a network template.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ProvisionedNetwork {
    pub id: NetworkUuid,
    pub name: String,
    /// Copied from the template at planning time.
    pub cidr: String,
    /// Name of the network template this copy came from.
    pub template: String,
    pub team_id: TeamUuid,
    pub build_id: BuildUuid,
}

/// The team-specific instantiation of a host template.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ProvisionedHost {
    pub id: HostUuid,
    /// Address computed from the owning network's CIDR and the
    /// template's declared offset.
    pub subnet_ip: Ipv4Addr,
    /// Hostname of the host template this copy came from.
    pub template: String,
    pub network_id: NetworkUuid,
    /// The terminal plan node of this host's step chain; dependents
    /// anchor on it.  Set exactly once when the chain is planned.
    pub end_step_plan: Option<PlanUuid>,
}

/// One ordered unit of host configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ProvisioningStep {
    pub id: StepUuid,
    pub host_id: HostUuid,
    /// Host-local ordering; 0 is reserved for the optional bootstrap
    /// step, declared steps count from 1.
    pub step_number: u32,
    pub payload: StepPayload,
}

impl ProvisioningStep {
    pub fn step_type(&self) -> StepType {
        self.payload.step_type()
    }
}

/// Review state of a [`BuildCommit`].
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// Snapshotted and submitted to the approval workflow.
    InReview,
    /// Approved; infrastructure actions may dispatch.
    Approved,
    /// Rejected or timed out; nothing further dispatches.
    Cancelled,
}

/// An approval-gated snapshot of a freshly planned build.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct BuildCommit {
    pub id: CommitUuid,
    pub build_id: BuildUuid,
    /// Matches the build's revision at snapshot time.
    pub revision: u32,
    pub state: CommitState,
}

impl BuildCommit {
    pub fn new(build: &Build) -> BuildCommit {
        BuildCommit {
            id: CommitUuid::new_v4(),
            build_id: build.id,
            revision: build.revision,
            state: CommitState::InReview,
        }
    }
}
