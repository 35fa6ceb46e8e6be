// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The status tracker: the one writer of status rows.
//!
//! Every transition is checked against the state machine, persisted
//! through the datastore, and published on the notification bus, in
//! that order.  Planner and executor never call `status_set` directly.

use crate::Datastore;
use rampart_common::Error;
use rampart_types::events::BusEvent;
use rampart_types::events::NotificationBus;
use rampart_types::status::EntityRef;
use rampart_types::status::InvalidTransition;
use rampart_types::status::ProvisionState;
use rampart_types::status::Status;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;

#[derive(Clone)]
pub struct StatusTracker {
    datastore: Arc<dyn Datastore>,
    bus: Arc<dyn NotificationBus>,
    log: Logger,
}

impl StatusTracker {
    pub fn new(
        log: &Logger,
        datastore: Arc<dyn Datastore>,
        bus: Arc<dyn NotificationBus>,
    ) -> StatusTracker {
        StatusTracker {
            datastore,
            bus,
            log: log.new(o!("component" => "StatusTracker")),
        }
    }

    /// Moves `entity` to `state`, clearing any recorded error.
    pub async fn transition(
        &self,
        entity: &EntityRef,
        state: ProvisionState,
    ) -> Result<Status, Error> {
        self.apply(entity, state, None).await
    }

    /// Moves `entity` to `Failed`, recording `message`.
    pub async fn fail(
        &self,
        entity: &EntityRef,
        message: impl Into<String>,
    ) -> Result<Status, Error> {
        self.apply(entity, ProvisionState::Failed, Some(message.into()))
            .await
    }

    /// Records an error note without changing state (used when teardown
    /// of an already-doomed entity goes wrong).
    pub async fn annotate_error(
        &self,
        entity: &EntityRef,
        message: impl Into<String>,
    ) -> Result<Status, Error> {
        let current = self.datastore.status_get(entity).await?;
        let message = message.into();
        warn!(
            self.log, "error recorded without state change";
            "entity" => %entity,
            "state" => %current.state,
            "error" => &message,
        );
        let status = self
            .datastore
            .status_set(entity, current.state, Some(message))
            .await?;
        self.publish(&status);
        Ok(status)
    }

    async fn apply(
        &self,
        entity: &EntityRef,
        state: ProvisionState,
        error: Option<String>,
    ) -> Result<Status, Error> {
        let current = self.datastore.status_get(entity).await?;
        if !current.state.can_transition_to(state) {
            let rejected = InvalidTransition {
                entity: *entity,
                from: current.state,
                to: state,
            };
            return Err(Error::invalid_request(rejected.to_string()));
        }
        let status =
            self.datastore.status_set(entity, state, error).await?;
        info!(
            self.log, "status transition";
            "entity" => %entity,
            "from" => %current.state,
            "to" => %state,
        );
        self.publish(&status);
        Ok(status)
    }

    fn publish(&self, status: &Status) {
        self.bus.publish(BusEvent::StatusChanged {
            entity: status.entity,
            state: status.state,
            error: status.error.clone(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::InMemoryDatastore;
    use rampart_types::build::Build;
    use rampart_types::environment::Environment;
    use rampart_types::events::BroadcastBus;
    use rampart_types::EnvironmentUuid;

    async fn tracker_with_build(
        log: &Logger,
    ) -> (StatusTracker, Arc<BroadcastBus>, EntityRef) {
        let datastore = Arc::new(InMemoryDatastore::new(log));
        let bus = Arc::new(BroadcastBus::new(log, 16));
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "env".to_string(),
            revision: 0,
            team_count: 1,
            networks: vec![],
            hosts: vec![],
        };
        let build =
            datastore.build_create(Build::new(&env, 0)).await.unwrap();
        let tracker =
            StatusTracker::new(log, datastore, bus.clone());
        (tracker, bus, EntityRef::build(build.id))
    }

    #[tokio::test]
    async fn test_transitions_persist_and_publish() {
        let log = rampart_test_utils::test_setup_log(
            "test_transitions_persist_and_publish",
        );
        let (tracker, bus, entity) = tracker_with_build(&log).await;
        let mut rx = bus.subscribe();

        let status = tracker
            .transition(&entity, ProvisionState::Awaiting)
            .await
            .unwrap();
        assert_eq!(status.state, ProvisionState::Awaiting);
        match rx.try_recv().unwrap() {
            BusEvent::StatusChanged { entity: e, state, .. } => {
                assert_eq!(e, entity);
                assert_eq!(state, ProvisionState::Awaiting);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let log = rampart_test_utils::test_setup_log(
            "test_illegal_transition_rejected",
        );
        let (tracker, bus, entity) = tracker_with_build(&log).await;
        let mut rx = bus.subscribe();

        // Planning -> Complete skips dispatch and is never legal.
        let err = tracker
            .transition(&entity, ProvisionState::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        // Nothing was published for the rejected transition.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_records_message() {
        let log = rampart_test_utils::test_setup_log(
            "test_fail_records_message",
        );
        let (tracker, _bus, entity) = tracker_with_build(&log).await;
        tracker
            .transition(&entity, ProvisionState::Awaiting)
            .await
            .unwrap();
        let status =
            tracker.fail(&entity, "builder exploded").await.unwrap();
        assert_eq!(status.state, ProvisionState::Failed);
        assert_eq!(status.error.as_deref(), Some("builder exploded"));
    }
}
