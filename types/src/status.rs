// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-entity status state machine.
//!
//! Every plan-bearing entity (build, team, network, host, step, plan
//! node) carries exactly one [`Status`] row, created in
//! [`ProvisionState::Planning`] alongside the entity.  All writes go
//! through the status tracker, which enforces the transition table below
//! and publishes every applied transition.

use crate::typed_uuid::BuildUuid;
use crate::typed_uuid::HostUuid;
use crate::typed_uuid::NetworkUuid;
use crate::typed_uuid::PlanUuid;
use crate::typed_uuid::StepUuid;
use crate::typed_uuid::TeamUuid;
use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use uuid::Uuid;

/// The lifecycle state of one plan-bearing entity.
///
/// The source of record historically mixed free-form strings with typed
/// constants for these; here there is exactly one closed enum.
#[derive(
    Clone, Copy, Debug, Deserialize, EnumIter, Eq, Ord, PartialEq,
    PartialOrd, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Created by planning, not yet dispatched.
    Planning,
    /// Dispatched; waiting for predecessors before acting.
    Awaiting,
    /// The entity's action finished successfully.
    Complete,
    /// The entity's action failed.  Terminal unless re-planned.
    Failed,
    /// A predecessor failed, so this entity's action will never be
    /// dispatched.
    Blocked,
    /// Included in a delete/rebuild traversal; awaiting teardown.
    ToDelete,
}

impl ProvisionState {
    /// Whether the state machine permits moving from `self` to `target`.
    pub fn can_transition_to(self, target: ProvisionState) -> bool {
        use ProvisionState::*;
        matches!(
            (self, target),
            // Dispatch, and planning-time failure of the build itself.
            (Planning, Awaiting)
                | (Planning, Failed)
                // Outcome of a dispatched action.
                | (Awaiting, Complete)
                | (Awaiting, Failed)
                // Fail-fast propagation from a failed predecessor.
                | (Planning, Blocked)
                | (Awaiting, Blocked)
                // Delete-traversal inclusion.
                | (Planning, ToDelete)
                | (Complete, ToDelete)
                | (Failed, ToDelete)
                | (Blocked, ToDelete)
                // Rebuild-traversal reset for re-execution.
                | (ToDelete, Planning)
        )
    }

    /// Whether this state ends an entity's forward progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProvisionState::Complete
                | ProvisionState::Failed
                | ProvisionState::Blocked
        )
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionState::Planning => "planning",
            ProvisionState::Awaiting => "awaiting",
            ProvisionState::Complete => "complete",
            ProvisionState::Failed => "failed",
            ProvisionState::Blocked => "blocked",
            ProvisionState::ToDelete => "to_delete",
        };
        f.write_str(s)
    }
}

/// A rejected state-machine transition.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
#[error("illegal status transition {from} -> {to} for {entity}")]
pub struct InvalidTransition {
    pub entity: EntityRef,
    pub from: ProvisionState,
    pub to: ProvisionState,
}

/// The kinds of entity a [`Status`] row can belong to.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Build,
    Team,
    ProvisionedNetwork,
    ProvisionedHost,
    ProvisioningStep,
    PlanNode,
}

/// An (entity kind, id) pair identifying the owner of a status row or
/// the subject of a bus event.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize, JsonSchema,
)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn build(id: BuildUuid) -> EntityRef {
        EntityRef { kind: EntityKind::Build, id: id.into_untyped_uuid() }
    }

    pub fn team(id: TeamUuid) -> EntityRef {
        EntityRef { kind: EntityKind::Team, id: id.into_untyped_uuid() }
    }

    pub fn network(id: NetworkUuid) -> EntityRef {
        EntityRef {
            kind: EntityKind::ProvisionedNetwork,
            id: id.into_untyped_uuid(),
        }
    }

    pub fn host(id: HostUuid) -> EntityRef {
        EntityRef {
            kind: EntityKind::ProvisionedHost,
            id: id.into_untyped_uuid(),
        }
    }

    pub fn step(id: StepUuid) -> EntityRef {
        EntityRef {
            kind: EntityKind::ProvisioningStep,
            id: id.into_untyped_uuid(),
        }
    }

    pub fn plan_node(id: PlanUuid) -> EntityRef {
        EntityRef { kind: EntityKind::PlanNode, id: id.into_untyped_uuid() }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.kind, self.id)
    }
}

/// One entity's state-machine instance.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Status {
    pub entity: EntityRef,
    pub state: ProvisionState,
    /// Populated when `state` is `Failed` (or when teardown hit an
    /// error that did not change the state).
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    /// A fresh status row for a just-created entity.
    pub fn new_planning(entity: EntityRef) -> Status {
        Status {
            entity,
            state: ProvisionState::Planning,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_transition_table() {
        use ProvisionState::*;
        let legal = [
            (Planning, Awaiting),
            (Planning, Failed),
            (Planning, Blocked),
            (Planning, ToDelete),
            (Awaiting, Complete),
            (Awaiting, Failed),
            (Awaiting, Blocked),
            (Complete, ToDelete),
            (Failed, ToDelete),
            (Blocked, ToDelete),
            (ToDelete, Planning),
        ];
        for from in ProvisionState::iter() {
            for to in ProvisionState::iter() {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        use ProvisionState::*;
        assert!(Complete.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Blocked.is_terminal());
        assert!(!Planning.is_terminal());
        assert!(!Awaiting.is_terminal());
        assert!(!ToDelete.is_terminal());
    }
}
