// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the rampart planner, executor, and their
//! collaborators.
//!
//! This crate holds the declarative environment templates, the concrete
//! per-team entities those templates expand into, the plan DAG, and the
//! status state machine attached to every plan-bearing entity.  It lives
//! apart from the planner and executor because both sides (and the
//! persistence collaborator between them) need the same definitions.

pub mod build;
pub mod environment;
pub mod events;
pub mod plan;
pub mod status;
pub mod typed_uuid;

pub use typed_uuid::BuildUuid;
pub use typed_uuid::CommitUuid;
pub use typed_uuid::EnvironmentUuid;
pub use typed_uuid::HostUuid;
pub use typed_uuid::NetworkUuid;
pub use typed_uuid::PlanUuid;
pub use typed_uuid::StepUuid;
pub use typed_uuid::TeamUuid;
