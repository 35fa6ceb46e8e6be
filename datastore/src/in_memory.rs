// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A `Mutex`-over-maps [`Datastore`] for tests and single-process use.

use crate::Datastore;
use async_trait::async_trait;
use chrono::Utc;
use rampart_common::Error;
use rampart_common::LookupType;
use rampart_common::ResourceType;
use rampart_types::build::Build;
use rampart_types::build::BuildCommit;
use rampart_types::build::CommitState;
use rampart_types::build::ProvisionedHost;
use rampart_types::build::ProvisionedNetwork;
use rampart_types::build::ProvisioningStep;
use rampart_types::build::Team;
use rampart_types::plan::PlanNode;
use rampart_types::status::EntityKind;
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
use slog::Logger;
use slog::o;
use slog::trace;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    builds: BTreeMap<BuildUuid, Build>,
    teams: BTreeMap<TeamUuid, Team>,
    networks: BTreeMap<NetworkUuid, ProvisionedNetwork>,
    hosts: BTreeMap<HostUuid, ProvisionedHost>,
    steps: BTreeMap<StepUuid, ProvisioningStep>,
    commits: BTreeMap<CommitUuid, BuildCommit>,
    plans: BTreeMap<PlanUuid, PlanNode>,
    statuses: BTreeMap<(EntityKind, Uuid), Status>,
}

impl Inner {
    fn insert_status(&mut self, entity: EntityRef) {
        self.statuses
            .insert((entity.kind, entity.id), Status::new_planning(entity));
    }

    fn remove_status(&mut self, entity: EntityRef) {
        self.statuses.remove(&(entity.kind, entity.id));
    }
}

/// The reference [`Datastore`].
///
/// A single `std::sync::Mutex` serializes every access; nothing holds
/// the lock across an await point.
pub struct InMemoryDatastore {
    inner: Mutex<Inner>,
    log: Logger,
}

impl InMemoryDatastore {
    pub fn new(log: &Logger) -> InMemoryDatastore {
        InMemoryDatastore {
            inner: Mutex::new(Inner::default()),
            log: log.new(o!("component" => "InMemoryDatastore")),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a writer panicked mid-update; there is
        // no recovery story for that in a test datastore.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn not_found(type_name: ResourceType, id: Uuid) -> Error {
    LookupType::ById(id).into_not_found(type_name)
}

fn already_exists(type_name: ResourceType, id: Uuid) -> Error {
    Error::ObjectAlreadyExists { type_name, object_name: id.to_string() }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn build_create(&self, build: Build) -> Result<Build, Error> {
        let mut inner = self.lock();
        if inner.builds.contains_key(&build.id) {
            return Err(already_exists(
                ResourceType::Build,
                build.id.into_untyped_uuid(),
            ));
        }
        trace!(self.log, "create build"; "build_id" => %build.id);
        inner.insert_status(EntityRef::build(build.id));
        inner.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn build_get(&self, id: BuildUuid) -> Result<Build, Error> {
        self.lock().builds.get(&id).cloned().ok_or_else(|| {
            not_found(ResourceType::Build, id.into_untyped_uuid())
        })
    }

    async fn build_count_for_environment(
        &self,
        environment_id: EnvironmentUuid,
    ) -> Result<u32, Error> {
        let count = self
            .lock()
            .builds
            .values()
            .filter(|b| b.environment_id == environment_id)
            .count();
        u32::try_from(count).map_err(|_| {
            Error::internal_error("build count exceeds u32::MAX")
        })
    }

    async fn build_delete(&self, id: BuildUuid) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.builds.remove(&id).is_none() {
            return Err(not_found(
                ResourceType::Build,
                id.into_untyped_uuid(),
            ));
        }
        inner.remove_status(EntityRef::build(id));

        let teams: Vec<TeamUuid> = inner
            .teams
            .values()
            .filter(|t| t.build_id == id)
            .map(|t| t.id)
            .collect();
        let networks: Vec<NetworkUuid> = inner
            .networks
            .values()
            .filter(|n| n.build_id == id)
            .map(|n| n.id)
            .collect();
        let hosts: Vec<HostUuid> = inner
            .hosts
            .values()
            .filter(|h| {
                inner
                    .networks
                    .get(&h.network_id)
                    .map(|n| n.build_id == id)
                    .unwrap_or(false)
            })
            .map(|h| h.id)
            .collect();
        let steps: Vec<StepUuid> = inner
            .steps
            .values()
            .filter(|s| hosts.contains(&s.host_id))
            .map(|s| s.id)
            .collect();
        let plans: Vec<PlanUuid> = inner
            .plans
            .values()
            .filter(|p| p.build_id == id)
            .map(|p| p.id)
            .collect();
        let commits: Vec<CommitUuid> = inner
            .commits
            .values()
            .filter(|c| c.build_id == id)
            .map(|c| c.id)
            .collect();

        for step_id in steps {
            inner.steps.remove(&step_id);
            inner.remove_status(EntityRef::step(step_id));
        }
        for host_id in hosts {
            inner.hosts.remove(&host_id);
            inner.remove_status(EntityRef::host(host_id));
        }
        for network_id in networks {
            inner.networks.remove(&network_id);
            inner.remove_status(EntityRef::network(network_id));
        }
        for team_id in teams {
            inner.teams.remove(&team_id);
            inner.remove_status(EntityRef::team(team_id));
        }
        for plan_id in plans {
            inner.plans.remove(&plan_id);
            inner.remove_status(EntityRef::plan_node(plan_id));
        }
        for commit_id in commits {
            inner.commits.remove(&commit_id);
        }
        trace!(self.log, "deleted build"; "build_id" => %id);
        Ok(())
    }

    async fn team_create(&self, team: Team) -> Result<Team, Error> {
        let mut inner = self.lock();
        if inner.teams.contains_key(&team.id) {
            return Err(already_exists(
                ResourceType::Team,
                team.id.into_untyped_uuid(),
            ));
        }
        inner.insert_status(EntityRef::team(team.id));
        inner.teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn teams_for_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<Vec<Team>, Error> {
        let mut teams: Vec<Team> = self
            .lock()
            .teams
            .values()
            .filter(|t| t.build_id == build_id)
            .cloned()
            .collect();
        teams.sort_by_key(|t| t.team_number);
        Ok(teams)
    }

    async fn network_create(
        &self,
        network: ProvisionedNetwork,
    ) -> Result<ProvisionedNetwork, Error> {
        let mut inner = self.lock();
        if inner.networks.contains_key(&network.id) {
            return Err(already_exists(
                ResourceType::ProvisionedNetwork,
                network.id.into_untyped_uuid(),
            ));
        }
        inner.insert_status(EntityRef::network(network.id));
        inner.networks.insert(network.id, network.clone());
        Ok(network)
    }

    async fn network_get(
        &self,
        id: NetworkUuid,
    ) -> Result<ProvisionedNetwork, Error> {
        self.lock().networks.get(&id).cloned().ok_or_else(|| {
            not_found(
                ResourceType::ProvisionedNetwork,
                id.into_untyped_uuid(),
            )
        })
    }

    async fn networks_for_team(
        &self,
        team_id: TeamUuid,
    ) -> Result<Vec<ProvisionedNetwork>, Error> {
        Ok(self
            .lock()
            .networks
            .values()
            .filter(|n| n.team_id == team_id)
            .cloned()
            .collect())
    }

    async fn host_create(
        &self,
        host: ProvisionedHost,
    ) -> Result<ProvisionedHost, Error> {
        let mut inner = self.lock();
        if inner.hosts.contains_key(&host.id) {
            return Err(already_exists(
                ResourceType::ProvisionedHost,
                host.id.into_untyped_uuid(),
            ));
        }
        inner.insert_status(EntityRef::host(host.id));
        inner.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn host_get(
        &self,
        id: HostUuid,
    ) -> Result<ProvisionedHost, Error> {
        self.lock().hosts.get(&id).cloned().ok_or_else(|| {
            not_found(ResourceType::ProvisionedHost, id.into_untyped_uuid())
        })
    }

    async fn host_find(
        &self,
        network_id: NetworkUuid,
        template: &str,
    ) -> Result<Option<ProvisionedHost>, Error> {
        Ok(self
            .lock()
            .hosts
            .values()
            .find(|h| h.network_id == network_id && h.template == template)
            .cloned())
    }

    async fn hosts_for_network(
        &self,
        network_id: NetworkUuid,
    ) -> Result<Vec<ProvisionedHost>, Error> {
        Ok(self
            .lock()
            .hosts
            .values()
            .filter(|h| h.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn host_set_end_step(
        &self,
        id: HostUuid,
        end_step: PlanUuid,
    ) -> Result<ProvisionedHost, Error> {
        let mut inner = self.lock();
        let host = inner.hosts.get_mut(&id).ok_or_else(|| {
            not_found(ResourceType::ProvisionedHost, id.into_untyped_uuid())
        })?;
        if host.end_step_plan.is_some() {
            return Err(Error::invalid_request(format!(
                "end step already recorded for host {id}"
            )));
        }
        host.end_step_plan = Some(end_step);
        Ok(host.clone())
    }

    async fn step_create(
        &self,
        step: ProvisioningStep,
    ) -> Result<ProvisioningStep, Error> {
        let mut inner = self.lock();
        if inner.steps.contains_key(&step.id) {
            return Err(already_exists(
                ResourceType::ProvisioningStep,
                step.id.into_untyped_uuid(),
            ));
        }
        inner.insert_status(EntityRef::step(step.id));
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn step_get(
        &self,
        id: StepUuid,
    ) -> Result<ProvisioningStep, Error> {
        self.lock().steps.get(&id).cloned().ok_or_else(|| {
            not_found(ResourceType::ProvisioningStep, id.into_untyped_uuid())
        })
    }

    async fn steps_for_host(
        &self,
        host_id: HostUuid,
    ) -> Result<Vec<ProvisioningStep>, Error> {
        let mut steps: Vec<ProvisioningStep> = self
            .lock()
            .steps
            .values()
            .filter(|s| s.host_id == host_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn commit_create(
        &self,
        commit: BuildCommit,
    ) -> Result<BuildCommit, Error> {
        let mut inner = self.lock();
        if inner.commits.contains_key(&commit.id) {
            return Err(already_exists(
                ResourceType::BuildCommit,
                commit.id.into_untyped_uuid(),
            ));
        }
        inner.commits.insert(commit.id, commit.clone());
        Ok(commit)
    }

    async fn commit_get(
        &self,
        id: CommitUuid,
    ) -> Result<BuildCommit, Error> {
        self.lock().commits.get(&id).cloned().ok_or_else(|| {
            not_found(ResourceType::BuildCommit, id.into_untyped_uuid())
        })
    }

    async fn commit_set_state(
        &self,
        id: CommitUuid,
        state: CommitState,
    ) -> Result<BuildCommit, Error> {
        let mut inner = self.lock();
        let commit = inner.commits.get_mut(&id).ok_or_else(|| {
            not_found(ResourceType::BuildCommit, id.into_untyped_uuid())
        })?;
        commit.state = state;
        Ok(commit.clone())
    }

    async fn plan_create(&self, node: PlanNode) -> Result<PlanNode, Error> {
        let mut inner = self.lock();
        if inner.plans.contains_key(&node.id) {
            return Err(already_exists(
                ResourceType::PlanNode,
                node.id.into_untyped_uuid(),
            ));
        }
        // Every declared predecessor must exist before its successor;
        // wire the reverse edge while checking.
        for prev_id in &node.prev {
            if !inner.plans.contains_key(prev_id) {
                return Err(not_found(
                    ResourceType::PlanNode,
                    prev_id.into_untyped_uuid(),
                ));
            }
        }
        for prev_id in node.prev.clone() {
            if let Some(prev) = inner.plans.get_mut(&prev_id) {
                prev.next.insert(node.id);
            }
        }
        inner.insert_status(EntityRef::plan_node(node.id));
        inner.plans.insert(node.id, node.clone());
        Ok(node)
    }

    async fn plan_get(&self, id: PlanUuid) -> Result<PlanNode, Error> {
        self.lock().plans.get(&id).cloned().ok_or_else(|| {
            not_found(ResourceType::PlanNode, id.into_untyped_uuid())
        })
    }

    async fn plans_for_build(
        &self,
        build_id: BuildUuid,
    ) -> Result<Vec<PlanNode>, Error> {
        let mut plans: Vec<PlanNode> = self
            .lock()
            .plans
            .values()
            .filter(|p| p.build_id == build_id)
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.step_number, p.id));
        Ok(plans)
    }

    async fn plan_prev(&self, id: PlanUuid) -> Result<Vec<PlanNode>, Error> {
        let inner = self.lock();
        let node = inner.plans.get(&id).ok_or_else(|| {
            not_found(ResourceType::PlanNode, id.into_untyped_uuid())
        })?;
        Ok(node.prev.iter().filter_map(|p| inner.plans.get(p)).cloned()
            .collect())
    }

    async fn plan_next(&self, id: PlanUuid) -> Result<Vec<PlanNode>, Error> {
        let inner = self.lock();
        let node = inner.plans.get(&id).ok_or_else(|| {
            not_found(ResourceType::PlanNode, id.into_untyped_uuid())
        })?;
        Ok(node.next.iter().filter_map(|n| inner.plans.get(n)).cloned()
            .collect())
    }

    async fn status_get(&self, entity: &EntityRef) -> Result<Status, Error> {
        self.lock()
            .statuses
            .get(&(entity.kind, entity.id))
            .cloned()
            .ok_or_else(|| not_found(ResourceType::Status, entity.id))
    }

    async fn status_set(
        &self,
        entity: &EntityRef,
        state: ProvisionState,
        error: Option<String>,
    ) -> Result<Status, Error> {
        let mut inner = self.lock();
        let status = inner
            .statuses
            .get_mut(&(entity.kind, entity.id))
            .ok_or_else(|| not_found(ResourceType::Status, entity.id))?;
        status.state = state;
        status.error = error;
        status.updated_at = Utc::now();
        Ok(status.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rampart_types::environment::Environment;
    use rampart_types::plan::PlanPayload;

    fn empty_environment() -> Environment {
        Environment {
            id: EnvironmentUuid::new_v4(),
            name: "env".to_string(),
            revision: 3,
            team_count: 1,
            networks: vec![],
            hosts: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_sets_planning_status() {
        let log = rampart_test_utils::test_setup_log(
            "test_create_sets_planning_status",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = ds.build_create(Build::new(&env, 0)).await.unwrap();
        let status =
            ds.status_get(&EntityRef::build(build.id)).await.unwrap();
        assert_eq!(status.state, ProvisionState::Planning);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let log = rampart_test_utils::test_setup_log(
            "test_duplicate_create_rejected",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = Build::new(&env, 0);
        ds.build_create(build.clone()).await.unwrap();
        let err = ds.build_create(build).await.unwrap_err();
        assert!(matches!(err, Error::ObjectAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_plan_create_wires_next_edges() {
        let log = rampart_test_utils::test_setup_log(
            "test_plan_create_wires_next_edges",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = ds.build_create(Build::new(&env, 0)).await.unwrap();
        let root =
            ds.plan_create(PlanNode::root(build.id)).await.unwrap();
        let team = Team::new(&build, 0);
        let team = ds.team_create(team).await.unwrap();
        let child = ds
            .plan_create(PlanNode::child(
                build.id,
                PlanPayload::Team(team.id),
                &[&root],
            ))
            .await
            .unwrap();

        let root_now = ds.plan_get(root.id).await.unwrap();
        assert!(root_now.next.contains(&child.id));
        let nexts = ds.plan_next(root.id).await.unwrap();
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].id, child.id);
        let prevs = ds.plan_prev(child.id).await.unwrap();
        assert_eq!(prevs.len(), 1);
        assert_eq!(prevs[0].id, root.id);
    }

    #[tokio::test]
    async fn test_plan_create_requires_existing_prev() {
        let log = rampart_test_utils::test_setup_log(
            "test_plan_create_requires_existing_prev",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = ds.build_create(Build::new(&env, 0)).await.unwrap();
        let orphan = PlanNode::root(build.id);
        let mut child = PlanNode::root(build.id);
        child.prev.insert(orphan.id);
        let err = ds.plan_create(child).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_host_end_step_is_write_once() {
        let log = rampart_test_utils::test_setup_log(
            "test_host_end_step_is_write_once",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = ds.build_create(Build::new(&env, 0)).await.unwrap();
        let team = ds.team_create(Team::new(&build, 0)).await.unwrap();
        let network = ds
            .network_create(ProvisionedNetwork {
                id: NetworkUuid::new_v4(),
                name: "dmz".to_string(),
                cidr: "10.0.0.0/24".to_string(),
                template: "dmz".to_string(),
                team_id: team.id,
                build_id: build.id,
            })
            .await
            .unwrap();
        let host = ds
            .host_create(ProvisionedHost {
                id: HostUuid::new_v4(),
                subnet_ip: "10.0.0.5".parse().unwrap(),
                template: "web".to_string(),
                network_id: network.id,
                end_step_plan: None,
            })
            .await
            .unwrap();
        let root = ds.plan_create(PlanNode::root(build.id)).await.unwrap();
        ds.host_set_end_step(host.id, root.id).await.unwrap();
        let err =
            ds.host_set_end_step(host.id, root.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));

        let found =
            ds.host_find(network.id, "web").await.unwrap().unwrap();
        assert_eq!(found.id, host.id);
        assert_eq!(found.end_step_plan, Some(root.id));
        assert!(ds.host_find(network.id, "db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_delete_cascades() {
        let log = rampart_test_utils::test_setup_log(
            "test_build_delete_cascades",
        );
        let ds = InMemoryDatastore::new(&log);
        let env = empty_environment();
        let build = ds.build_create(Build::new(&env, 0)).await.unwrap();
        let team = ds.team_create(Team::new(&build, 0)).await.unwrap();
        let network = ds
            .network_create(ProvisionedNetwork {
                id: NetworkUuid::new_v4(),
                name: "dmz".to_string(),
                cidr: "10.0.0.0/24".to_string(),
                template: "dmz".to_string(),
                team_id: team.id,
                build_id: build.id,
            })
            .await
            .unwrap();
        let root = ds.plan_create(PlanNode::root(build.id)).await.unwrap();
        let commit =
            ds.commit_create(BuildCommit::new(&build)).await.unwrap();

        ds.build_delete(build.id).await.unwrap();
        assert!(ds.build_get(build.id).await.is_err());
        assert!(ds.network_get(network.id).await.is_err());
        assert!(ds.plan_get(root.id).await.is_err());
        assert!(ds.commit_get(commit.id).await.is_err());
        assert!(ds
            .status_get(&EntityRef::team(team.id))
            .await
            .is_err());
        assert_eq!(
            ds.build_count_for_environment(env.id).await.unwrap(),
            0
        );
    }
}
