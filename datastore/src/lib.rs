// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistence collaborator.
//!
//! The planner and executor never talk to a database directly; they go
//! through the [`Datastore`] trait.  A concrete deployment backs this
//! with a real database.  This crate ships [`InMemoryDatastore`], a
//! `Mutex`-over-maps implementation that is the reference for trait
//! semantics and the backing store for the test suite.
//!
//! Implementations must serialize concurrent writes to the same entity;
//! the datastore is the sole source of truth for plan and status state.

mod in_memory;
mod tracker;

pub use in_memory::InMemoryDatastore;
pub use tracker::StatusTracker;

use async_trait::async_trait;
use rampart_common::Error;
use rampart_types::build::Build;
use rampart_types::build::BuildCommit;
use rampart_types::build::CommitState;
use rampart_types::build::ProvisionedHost;
use rampart_types::build::ProvisionedNetwork;
use rampart_types::build::ProvisioningStep;
use rampart_types::build::Team;
use rampart_types::plan::PlanNode;
use rampart_types::status::EntityRef;
use rampart_types::status::ProvisionState;
use rampart_types::status::Status;
use rampart_types::BuildUuid;
use rampart_types::CommitUuid;
use rampart_types::EnvironmentUuid;
use rampart_types::HostUuid;
use rampart_types::NetworkUuid;
use rampart_types::PlanUuid;
use rampart_types::StepUuid;
use rampart_types::TeamUuid;

/// Create/query/update access to every entity the core persists.
///
/// Creating a plan-bearing entity also creates its status row in
/// `Planning`.  Creating a plan node wires the reverse `next` edge onto
/// every node named in its `prev` set.
#[async_trait]
pub trait Datastore: Send + Sync {
    // Builds
    async fn build_create(&self, build: Build) -> Result<Build, Error>;
    async fn build_get(&self, id: BuildUuid) -> Result<Build, Error>;
    /// How many builds have been created for this environment; used as
    /// the next build's revision.
    async fn build_count_for_environment(
        &self,
        environment_id: EnvironmentUuid,
    ) -> Result<u32, Error>;
    /// Removes the build and, transitively, everything it owns.
    async fn build_delete(&self, id: BuildUuid) -> Result<(), Error>;

    // Teams
    async fn team_create(&self, team: Team) -> Result<Team, Error>;
    async fn teams_for_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<Vec<Team>, Error>;

    // Provisioned networks
    async fn network_create(
        &self,
        network: ProvisionedNetwork,
    ) -> Result<ProvisionedNetwork, Error>;
    async fn network_get(
        &self,
        id: NetworkUuid,
    ) -> Result<ProvisionedNetwork, Error>;
    async fn networks_for_team(
        &self,
        team_id: TeamUuid,
    ) -> Result<Vec<ProvisionedNetwork>, Error>;

    // Provisioned hosts
    async fn host_create(
        &self,
        host: ProvisionedHost,
    ) -> Result<ProvisionedHost, Error>;
    async fn host_get(&self, id: HostUuid) -> Result<ProvisionedHost, Error>;
    /// The idempotency lookup: the host instantiated from `template`
    /// within one provisioned network, if it exists.
    async fn host_find(
        &self,
        network_id: NetworkUuid,
        template: &str,
    ) -> Result<Option<ProvisionedHost>, Error>;
    async fn hosts_for_network(
        &self,
        network_id: NetworkUuid,
    ) -> Result<Vec<ProvisionedHost>, Error>;
    /// Records the host's end-step anchor.  Fails if already set; the
    /// field is write-once.
    async fn host_set_end_step(
        &self,
        id: HostUuid,
        end_step: PlanUuid,
    ) -> Result<ProvisionedHost, Error>;

    // Provisioning steps
    async fn step_create(
        &self,
        step: ProvisioningStep,
    ) -> Result<ProvisioningStep, Error>;
    async fn step_get(&self, id: StepUuid)
        -> Result<ProvisioningStep, Error>;
    /// Steps for one host, ordered by host-local step number.
    async fn steps_for_host(
        &self,
        host_id: HostUuid,
    ) -> Result<Vec<ProvisioningStep>, Error>;

    // Build commits
    async fn commit_create(
        &self,
        commit: BuildCommit,
    ) -> Result<BuildCommit, Error>;
    async fn commit_get(&self, id: CommitUuid) -> Result<BuildCommit, Error>;
    async fn commit_set_state(
        &self,
        id: CommitUuid,
        state: CommitState,
    ) -> Result<BuildCommit, Error>;

    // Plan graph
    async fn plan_create(&self, node: PlanNode) -> Result<PlanNode, Error>;
    async fn plan_get(&self, id: PlanUuid) -> Result<PlanNode, Error>;
    async fn plans_for_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<Vec<PlanNode>, Error>;
    async fn plan_prev(&self, id: PlanUuid) -> Result<Vec<PlanNode>, Error>;
    async fn plan_next(&self, id: PlanUuid) -> Result<Vec<PlanNode>, Error>;

    // Status
    async fn status_get(&self, entity: &EntityRef) -> Result<Status, Error>;
    /// Unconditionally records a state (and optional error note) for an
    /// entity.  Transition legality is the status tracker's job, not
    /// the datastore's.
    async fn status_set(
        &self,
        entity: &EntityRef,
        state: ProvisionState,
        error: Option<String>,
    ) -> Result<Status, Error>;
}
