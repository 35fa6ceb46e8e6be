// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The build plan DAG.
//!
//! Planning emits one [`PlanNode`] per schedulable unit of work: the
//! build root, one milestone per team, one node per provisioned network
//! and host, and one per provisioning step.  Edges (`prev`/`next`) are
//! the partial order execution must respect; `step_number` is a
//! monotonic ordering hint along every path, not a globally unique
//! sequence.

use crate::status::EntityRef;
use crate::typed_uuid::BuildUuid;
use crate::typed_uuid::HostUuid;
use crate::typed_uuid::NetworkUuid;
use crate::typed_uuid::PlanUuid;
use crate::typed_uuid::StepUuid;
use crate::typed_uuid::TeamUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// The kind of work a plan node schedules.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    StartBuild,
    StartTeam,
    ProvisionNetwork,
    ProvisionHost,
    ExecuteStep,
}

/// The payload a plan node acts on.  The variant fixes the node's
/// [`PlanType`], so a node cannot reference a payload of the wrong kind.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanPayload {
    Build(BuildUuid),
    Team(TeamUuid),
    Network(NetworkUuid),
    Host(HostUuid),
    Step(StepUuid),
}

impl PlanPayload {
    pub fn plan_type(&self) -> PlanType {
        match self {
            PlanPayload::Build(_) => PlanType::StartBuild,
            PlanPayload::Team(_) => PlanType::StartTeam,
            PlanPayload::Network(_) => PlanType::ProvisionNetwork,
            PlanPayload::Host(_) => PlanType::ProvisionHost,
            PlanPayload::Step(_) => PlanType::ExecuteStep,
        }
    }

    /// The status-bearing entity this payload points at.
    pub fn entity(&self) -> EntityRef {
        match *self {
            PlanPayload::Build(id) => EntityRef::build(id),
            PlanPayload::Team(id) => EntityRef::team(id),
            PlanPayload::Network(id) => EntityRef::network(id),
            PlanPayload::Host(id) => EntityRef::host(id),
            PlanPayload::Step(id) => EntityRef::step(id),
        }
    }
}

/// A vertex in the build DAG.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct PlanNode {
    pub id: PlanUuid,
    pub build_id: BuildUuid,
    pub payload: PlanPayload,
    /// Ordering hint: strictly greater than every predecessor's.  The
    /// root is 0.
    pub step_number: u64,
    /// Direct predecessors; empty only for the root.
    pub prev: BTreeSet<PlanUuid>,
    /// Direct successors; maintained by the datastore when later nodes
    /// declare this node in their `prev` set.
    pub next: BTreeSet<PlanUuid>,
}

impl PlanNode {
    /// The root node of a build's plan.
    pub fn root(build_id: BuildUuid) -> PlanNode {
        PlanNode {
            id: PlanUuid::new_v4(),
            build_id,
            payload: PlanPayload::Build(build_id),
            step_number: 0,
            prev: BTreeSet::new(),
            next: BTreeSet::new(),
        }
    }

    /// A node downstream of `prev`, with `step_number` one past the
    /// furthest predecessor.
    pub fn child(
        build_id: BuildUuid,
        payload: PlanPayload,
        prev: &[&PlanNode],
    ) -> PlanNode {
        let step_number =
            1 + prev.iter().map(|p| p.step_number).max().unwrap_or(0);
        PlanNode {
            id: PlanUuid::new_v4(),
            build_id,
            payload,
            step_number,
            prev: prev.iter().map(|p| p.id).collect(),
            next: BTreeSet::new(),
        }
    }

    pub fn plan_type(&self) -> PlanType {
        self.payload.plan_type()
    }
}
