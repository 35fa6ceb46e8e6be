// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Notification-bus event types and the bus seam itself.
//!
//! Delivery is fire-and-forget: publishers never block and never learn
//! whether anyone was listening.  Front ends subscribe to mirror build
//! progress; nothing in the core depends on an event arriving.

use crate::build::CommitState;
use crate::status::EntityRef;
use crate::status::ProvisionState;
use crate::typed_uuid::BuildUuid;
use crate::typed_uuid::CommitUuid;
use crate::typed_uuid::EnvironmentUuid;
use crate::typed_uuid::TeamUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::o;
use tokio::sync::broadcast;

/// An entity-changed or milestone event, keyed by entity kind and id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A status row changed state.
    StatusChanged {
        entity: EntityRef,
        state: ProvisionState,
        error: Option<String>,
    },
    /// A build row was created by planning.
    BuildCreated {
        build: BuildUuid,
        environment: EnvironmentUuid,
        revision: u32,
    },
    /// One team's subtree finished planning.
    TeamPlanned { build: BuildUuid, team: TeamUuid, team_number: u32 },
    /// Planning aborted; partial rows remain for inspection.
    PlanningFailed { build: BuildUuid, message: String },
    /// A build commit moved through the approval workflow.
    CommitStateChanged {
        commit: CommitUuid,
        build: BuildUuid,
        state: CommitState,
    },
    /// Catch-all "something about this build changed" notification.
    BuildUpdated { build: BuildUuid },
}

/// The publish half of the notification bus.
///
/// Best-effort, unacknowledged.  Implementations must not block the
/// caller.
pub trait NotificationBus: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// A bus that drops everything, for callers that do not care.
#[derive(Debug, Default)]
pub struct NoopBus;

impl NotificationBus for NoopBus {
    fn publish(&self, _event: BusEvent) {}
}

/// An in-process bus backed by a tokio broadcast channel.
///
/// Lagging or absent subscribers lose events; that is the contract.
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
    log: Logger,
}

impl BroadcastBus {
    pub fn new(log: &Logger, capacity: usize) -> BroadcastBus {
        let (tx, _rx) = broadcast::channel(capacity);
        BroadcastBus { tx, log: log.new(o!("component" => "BroadcastBus")) }
    }

    /// Attach a new subscriber; it sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        // send() fails only when there are no receivers, which is fine
        // for an unacknowledged bus.
        if self.tx.send(event).is_err() {
            debug!(self.log, "no subscribers; event dropped");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_broadcast_bus_delivers_to_subscriber() {
        let log = Logger::root(slog::Discard, o!());
        let bus = BroadcastBus::new(&log, 8);
        let mut rx = bus.subscribe();
        let build = BuildUuid::new_v4();
        bus.publish(BusEvent::BuildUpdated { build });
        let event = rx.try_recv().unwrap();
        assert_eq!(event, BusEvent::BuildUpdated { build });
    }

    #[test]
    fn test_publish_without_subscribers_is_a_noop() {
        let log = Logger::root(slog::Discard, o!());
        let bus = BroadcastBus::new(&log, 8);
        bus.publish(BusEvent::BuildUpdated { build: BuildUuid::new_v4() });
    }
}
