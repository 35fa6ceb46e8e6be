// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planning: expanding an environment into a build's plan DAG.
//!
//! [`BuildPlanner::plan_build`] creates the build row and root plan
//! node, then fans one tokio task out per team.  Each team task expands
//! the declared networks and resolves every included host through the
//! dependency resolver.  Planning only writes rows and edges; nothing
//! here touches infrastructure.

mod resolver;
pub mod render;

pub use render::NoopRenderer;
pub use render::StepRenderer;

use rampart_common::address::AddressError;
use rampart_common::Error;
use rampart_datastore::Datastore;
use rampart_datastore::StatusTracker;
use rampart_types::build::Build;
use rampart_types::build::BuildCommit;
use rampart_types::build::Team;
use rampart_types::environment::Environment;
use rampart_types::events::BusEvent;
use rampart_types::events::NotificationBus;
use rampart_types::plan::PlanNode;
use rampart_types::plan::PlanPayload;
use rampart_types::status::EntityRef;
use rampart_types::StepUuid;
use resolver::HostResolver;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Planning-time knobs, threaded explicitly through the entry point.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    /// Whether planning invokes the script renderer for each planned
    /// step (a side effect some deployments want deferred).
    #[serde(default)]
    pub render_scripts: bool,
}

/// Errors raised while expanding an environment into a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// A declared dependency names a host or network template that
    /// does not exist in the environment.
    #[error("unknown dependency target host {host:?} in network {network:?}")]
    UnknownDependencyTarget { host: String, network: String },
    /// A dependency chain re-entered a host still being resolved.
    #[error("dependency cycle detected: {}", .chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },
    #[error("allocating subnet address for host {host:?}")]
    Address {
        host: String,
        #[source]
        error: AddressError,
    },
    #[error("rendering step {step} for host {host:?}")]
    Render {
        host: String,
        step: StepUuid,
        #[source]
        error: Error,
    },
    /// A team's planning task aborted (panic or cancellation), as
    /// opposed to returning one of the errors above.
    #[error("team planning task aborted: {message}")]
    TeamTaskAborted { message: String },
    #[error(transparent)]
    Datastore(#[from] Error),
}

/// A freshly planned build, awaiting commit review.
#[derive(Clone, Debug)]
pub struct PlannedBuild {
    pub build: Build,
    pub root: PlanNode,
    pub commit: BuildCommit,
}

#[derive(Clone)]
pub struct BuildPlanner {
    datastore: Arc<dyn Datastore>,
    tracker: StatusTracker,
    bus: Arc<dyn NotificationBus>,
    renderer: Arc<dyn StepRenderer>,
    config: PlannerConfig,
    log: Logger,
}

impl BuildPlanner {
    pub fn new(
        log: &Logger,
        datastore: Arc<dyn Datastore>,
        tracker: StatusTracker,
        bus: Arc<dyn NotificationBus>,
        renderer: Arc<dyn StepRenderer>,
        config: PlannerConfig,
    ) -> BuildPlanner {
        BuildPlanner {
            datastore,
            tracker,
            bus,
            renderer,
            config,
            log: log.new(o!("component" => "BuildPlanner")),
        }
    }

    /// Expands `environment` into a new build: one plan subtree per
    /// team, all downstream of a single root node.  On success the
    /// build's commit is in review; on failure the error is recorded on
    /// the build's status and partial rows remain for inspection.
    pub async fn plan_build(
        &self,
        environment: &Environment,
    ) -> Result<PlannedBuild, PlanError> {
        let revision = self
            .datastore
            .build_count_for_environment(environment.id)
            .await?;
        let build = self
            .datastore
            .build_create(Build::new(environment, revision))
            .await?;
        info!(
            self.log, "planning build";
            "build_id" => %build.id,
            "revision" => revision,
            "team_count" => environment.team_count,
        );
        self.bus.publish(BusEvent::BuildCreated {
            build: build.id,
            environment: environment.id,
            revision,
        });
        let root =
            self.datastore.plan_create(PlanNode::root(build.id)).await?;

        let environment = Arc::new(environment.clone());
        let mut tasks = JoinSet::new();
        for team_number in 0..environment.team_count {
            let planner = self.clone();
            let environment = Arc::clone(&environment);
            let build = build.clone();
            let root = root.clone();
            tasks.spawn(async move {
                planner
                    .expand_team(&environment, &build, &root, team_number)
                    .await
            });
        }

        let mut first_error: Option<PlanError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(team)) => {
                    self.bus.publish(BusEvent::TeamPlanned {
                        build: build.id,
                        team: team.id,
                        team_number: team.team_number,
                    });
                }
                Ok(Err(err)) => {
                    error!(
                        self.log, "team planning failed";
                        "build_id" => %build.id,
                        "error" => %err,
                    );
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(PlanError::TeamTaskAborted {
                        message: join_err.to_string(),
                    });
                }
            }
        }

        if let Some(err) = first_error {
            self.bus.publish(BusEvent::PlanningFailed {
                build: build.id,
                message: err.to_string(),
            });
            if let Err(status_err) = self
                .tracker
                .fail(&EntityRef::build(build.id), err.to_string())
                .await
            {
                warn!(
                    self.log, "failed to record planning failure";
                    "build_id" => %build.id,
                    "error" => %status_err,
                );
            }
            return Err(err);
        }

        let commit =
            self.datastore.commit_create(BuildCommit::new(&build)).await?;
        self.bus.publish(BusEvent::CommitStateChanged {
            commit: commit.id,
            build: build.id,
            state: commit.state,
        });
        info!(
            self.log, "build planned";
            "build_id" => %build.id,
            "commit_id" => %commit.id,
        );
        Ok(PlannedBuild { build, root, commit })
    }

    async fn expand_team(
        &self,
        environment: &Environment,
        build: &Build,
        root: &PlanNode,
        team_number: u32,
    ) -> Result<Team, PlanError> {
        let team = self
            .datastore
            .team_create(Team::new(build, team_number))
            .await?;
        let team_node = self
            .datastore
            .plan_create(PlanNode::child(
                build.id,
                PlanPayload::Team(team.id),
                &[root],
            ))
            .await?;

        match self
            .expand_team_networks(environment, build, &team, &team_node)
            .await
        {
            Ok(()) => Ok(team),
            Err(err) => {
                if let Err(status_err) = self
                    .tracker
                    .fail(&EntityRef::team(team.id), err.to_string())
                    .await
                {
                    warn!(
                        self.log, "failed to record team failure";
                        "team_id" => %team.id,
                        "error" => %status_err,
                    );
                }
                Err(err)
            }
        }
    }

    async fn expand_team_networks(
        &self,
        environment: &Environment,
        build: &Build,
        team: &Team,
        team_node: &PlanNode,
    ) -> Result<(), PlanError> {
        let mut resolver = HostResolver::new(
            &self.log,
            &self.datastore,
            &self.renderer,
            &self.config,
            environment,
            build,
            team,
            team_node,
        );
        for network in &environment.networks {
            resolver.ensure_network(network).await?;
            for host in &network.included_hosts {
                resolver.resolve(&network.name, host).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rampart_datastore::InMemoryDatastore;
    use rampart_types::environment::HostDependency;
    use rampart_types::environment::HostTemplate;
    use rampart_types::environment::NetworkTemplate;
    use rampart_types::environment::StepPayload;
    use rampart_types::events::NoopBus;
    use rampart_types::plan::PlanType;
    use rampart_types::EnvironmentUuid;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn host(
        hostname: &str,
        last_octet: u32,
        depends_on: Vec<HostDependency>,
    ) -> HostTemplate {
        HostTemplate {
            hostname: hostname.to_string(),
            description: None,
            os: "debian11".to_string(),
            last_octet,
            depends_on,
            bootstrap: None,
            provision_steps: vec![],
        }
    }

    fn dep(network: &str, host: &str) -> HostDependency {
        HostDependency {
            host: host.to_string(),
            network: network.to_string(),
        }
    }

    fn network(name: &str, cidr: &str, hosts: &[&str]) -> NetworkTemplate {
        NetworkTemplate {
            name: name.to_string(),
            cidr: cidr.to_string(),
            included_hosts:
                hosts.iter().map(|h| h.to_string()).collect(),
            tags: BTreeMap::new(),
        }
    }

    fn two_host_environment(team_count: u32) -> Environment {
        Environment {
            id: EnvironmentUuid::new_v4(),
            name: "spearphish-open".to_string(),
            revision: 1,
            team_count,
            networks: vec![network(
                "dmz",
                "10.0.0.0/24",
                &["web", "db"],
            )],
            hosts: vec![
                host("web", 10, vec![]),
                host("db", 20, vec![dep("dmz", "web")]),
            ],
        }
    }

    struct Harness {
        datastore: Arc<InMemoryDatastore>,
        planner: BuildPlanner,
    }

    fn harness(log: &Logger, config: PlannerConfig) -> Harness {
        let datastore = Arc::new(InMemoryDatastore::new(log));
        let bus: Arc<dyn NotificationBus> = Arc::new(NoopBus);
        let tracker = StatusTracker::new(
            log,
            datastore.clone(),
            bus.clone(),
        );
        let planner = BuildPlanner::new(
            log,
            datastore.clone(),
            tracker,
            bus,
            Arc::new(NoopRenderer),
            config,
        );
        Harness { datastore, planner }
    }

    #[tokio::test]
    async fn test_plan_build_two_teams() {
        let log = rampart_test_utils::test_setup_log(
            "test_plan_build_two_teams",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = two_host_environment(2);
        let planned = h.planner.plan_build(&env).await.unwrap();
        assert_eq!(planned.build.revision, 0);
        assert_eq!(planned.build.environment_revision, 1);
        assert_eq!(planned.root.step_number, 0);

        let teams = h
            .datastore
            .teams_for_build(planned.build.id)
            .await
            .unwrap();
        assert_eq!(teams.len(), 2);
        assert_eq!(
            teams.iter().map(|t| t.team_number).collect::<Vec<_>>(),
            vec![0, 1]
        );

        let mut total_networks = 0;
        let mut total_hosts = 0;
        for team in &teams {
            let networks = h
                .datastore
                .networks_for_team(team.id)
                .await
                .unwrap();
            total_networks += networks.len();
            for network in &networks {
                assert_eq!(network.cidr, "10.0.0.0/24");
                let hosts = h
                    .datastore
                    .hosts_for_network(network.id)
                    .await
                    .unwrap();
                total_hosts += hosts.len();

                let web = hosts
                    .iter()
                    .find(|h| h.template == "web")
                    .expect("web host");
                let db = hosts
                    .iter()
                    .find(|h| h.template == "db")
                    .expect("db host");
                assert_eq!(web.subnet_ip.to_string(), "10.0.0.10");
                assert_eq!(db.subnet_ip.to_string(), "10.0.0.20");

                // db depends on web, so db's entry node must sit after
                // web's end step and carry it as a predecessor.
                let web_end = web.end_step_plan.expect("web end step");
                let db_end = db.end_step_plan.expect("db end step");
                let web_end_node =
                    h.datastore.plan_get(web_end).await.unwrap();
                let db_entry_node =
                    h.datastore.plan_get(db_end).await.unwrap();
                assert!(
                    db_entry_node.step_number
                        > web_end_node.step_number
                );
                assert!(db_entry_node.prev.contains(&web_end));
            }
        }
        assert_eq!(total_networks, 2);
        assert_eq!(total_hosts, 4);

        // The two team subtrees reference entirely distinct rows.
        let mut seen = BTreeSet::new();
        for team in &teams {
            for network in
                h.datastore.networks_for_team(team.id).await.unwrap()
            {
                assert!(seen.insert(network.id));
                for host in h
                    .datastore
                    .hosts_for_network(network.id)
                    .await
                    .unwrap()
                {
                    assert!(host.end_step_plan.is_some());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_step_numbers_exceed_predecessors_everywhere() {
        let log = rampart_test_utils::test_setup_log(
            "test_step_numbers_exceed_predecessors_everywhere",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = two_host_environment(2);
        let planned = h.planner.plan_build(&env).await.unwrap();
        let plans = h
            .datastore
            .plans_for_build(planned.build.id)
            .await
            .unwrap();
        let roots: Vec<_> = plans
            .iter()
            .filter(|p| p.plan_type() == PlanType::StartBuild)
            .collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].step_number, 0);
        for node in &plans {
            for prev in &node.prev {
                let prev_node =
                    h.datastore.plan_get(*prev).await.unwrap();
                assert!(
                    node.step_number > prev_node.step_number,
                    "node {} step {} not after prev {} step {}",
                    node.id,
                    node.step_number,
                    prev_node.id,
                    prev_node.step_number,
                );
            }
            if node.plan_type() != PlanType::StartBuild {
                assert!(!node.prev.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_cross_network_dependency_creates_network_on_demand() {
        let log = rampart_test_utils::test_setup_log(
            "test_cross_network_dependency_creates_network_on_demand",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "two-net".to_string(),
            revision: 1,
            team_count: 1,
            networks: vec![
                // dmz is declared first but its host depends on a host
                // in corp, which has not been expanded yet.
                network("dmz", "10.0.0.0/24", &["web"]),
                network("corp", "10.1.0.0/24", &["ad"]),
            ],
            hosts: vec![
                host("web", 10, vec![dep("corp", "ad")]),
                host("ad", 5, vec![]),
            ],
        };
        let planned = h.planner.plan_build(&env).await.unwrap();
        let teams =
            h.datastore.teams_for_build(planned.build.id).await.unwrap();
        let networks = h
            .datastore
            .networks_for_team(teams[0].id)
            .await
            .unwrap();
        // corp was created on demand during web's resolution and not
        // duplicated when the expander reached it.
        assert_eq!(networks.len(), 2);
        let corp = networks
            .iter()
            .find(|n| n.name == "corp")
            .expect("corp network");
        let ad_hosts =
            h.datastore.hosts_for_network(corp.id).await.unwrap();
        assert_eq!(ad_hosts.len(), 1);

        // web's entry node anchors on ad's end step.
        let dmz = networks.iter().find(|n| n.name == "dmz").unwrap();
        let web = h
            .datastore
            .host_find(dmz.id, "web")
            .await
            .unwrap()
            .expect("web host");
        let ad_end = ad_hosts[0].end_step_plan.unwrap();
        let web_entry = h
            .datastore
            .plan_get(web.end_step_plan.unwrap())
            .await
            .unwrap();
        assert!(web_entry.prev.contains(&ad_end));
    }

    #[tokio::test]
    async fn test_dependency_cycle_detected() {
        let log = rampart_test_utils::test_setup_log(
            "test_dependency_cycle_detected",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "cycle".to_string(),
            revision: 1,
            team_count: 1,
            networks: vec![network("dmz", "10.0.0.0/24", &["a", "b"])],
            hosts: vec![
                host("a", 1, vec![dep("dmz", "b")]),
                host("b", 2, vec![dep("dmz", "a")]),
            ],
        };
        let err = h.planner.plan_build(&env).await.unwrap_err();
        assert!(
            matches!(err, PlanError::DependencyCycle { .. }),
            "unexpected error {err}"
        );
    }

    #[tokio::test]
    async fn test_unknown_dependency_target_aborts_team() {
        let log = rampart_test_utils::test_setup_log(
            "test_unknown_dependency_target_aborts_team",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "dangling".to_string(),
            revision: 1,
            team_count: 1,
            networks: vec![network("dmz", "10.0.0.0/24", &["web"])],
            hosts: vec![host(
                "web",
                10,
                vec![dep("dmz", "no-such-host")],
            )],
        };
        let err = h.planner.plan_build(&env).await.unwrap_err();
        assert!(matches!(
            err,
            PlanError::UnknownDependencyTarget { .. }
        ));
    }

    #[tokio::test]
    async fn test_step_chain_with_bootstrap() {
        let log = rampart_test_utils::test_setup_log(
            "test_step_chain_with_bootstrap",
        );
        let h = harness(&log, PlannerConfig::default());
        let mut web = host("web", 10, vec![]);
        web.bootstrap = Some(StepPayload::Script {
            source: "bootstrap.sh".to_string(),
            args: vec![],
        });
        web.provision_steps = vec![
            StepPayload::FileDownload {
                source_url: "https://assets.example/site.tar".to_string(),
                destination: "/tmp/site.tar".to_string(),
            },
            StepPayload::FileExtract {
                archive: "/tmp/site.tar".to_string(),
                destination: "/var/www".to_string(),
            },
        ];
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "steps".to_string(),
            revision: 1,
            team_count: 1,
            networks: vec![network("dmz", "10.0.0.0/24", &["web"])],
            hosts: vec![web],
        };
        let planned = h.planner.plan_build(&env).await.unwrap();
        let teams =
            h.datastore.teams_for_build(planned.build.id).await.unwrap();
        let networks = h
            .datastore
            .networks_for_team(teams[0].id)
            .await
            .unwrap();
        let web = h
            .datastore
            .host_find(networks[0].id, "web")
            .await
            .unwrap()
            .unwrap();
        let steps =
            h.datastore.steps_for_host(web.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps.iter().map(|s| s.step_number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // The chain is strictly linear: each step node's sole prev is
        // the previous node, and the host's end step is the last one.
        let plans =
            h.datastore.plans_for_build(planned.build.id).await.unwrap();
        let step_nodes: Vec<_> = plans
            .iter()
            .filter(|p| p.plan_type() == PlanType::ExecuteStep)
            .collect();
        assert_eq!(step_nodes.len(), 3);
        for node in &step_nodes {
            assert_eq!(node.prev.len(), 1);
        }
        assert_eq!(
            web.end_step_plan.unwrap(),
            step_nodes.last().unwrap().id
        );
    }

    /// Renderer that records which steps it was asked to render.
    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Mutex<Vec<StepUuid>>,
    }

    #[async_trait::async_trait]
    impl StepRenderer for RecordingRenderer {
        async fn render_step(
            &self,
            _host: &rampart_types::build::ProvisionedHost,
            step: &rampart_types::build::ProvisioningStep,
        ) -> Result<(), Error> {
            self.rendered.lock().unwrap().push(step.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_render_scripts_config_gates_renderer() {
        let log = rampart_test_utils::test_setup_log(
            "test_render_scripts_config_gates_renderer",
        );
        let datastore = Arc::new(InMemoryDatastore::new(&log));
        let bus: Arc<dyn NotificationBus> = Arc::new(NoopBus);
        let tracker =
            StatusTracker::new(&log, datastore.clone(), bus.clone());
        let renderer = Arc::new(RecordingRenderer::default());

        let mut web = host("web", 10, vec![]);
        web.provision_steps = vec![StepPayload::Command {
            program: "systemctl".to_string(),
            args: vec!["enable".to_string(), "nginx".to_string()],
        }];
        let env = Environment {
            id: EnvironmentUuid::new_v4(),
            name: "render".to_string(),
            revision: 1,
            team_count: 1,
            networks: vec![network("dmz", "10.0.0.0/24", &["web"])],
            hosts: vec![web],
        };

        // Disabled: renderer untouched.
        let planner = BuildPlanner::new(
            &log,
            datastore.clone(),
            tracker.clone(),
            bus.clone(),
            renderer.clone(),
            PlannerConfig { render_scripts: false },
        );
        planner.plan_build(&env).await.unwrap();
        assert!(renderer.rendered.lock().unwrap().is_empty());

        // Enabled: one render call per planned step.
        let planner = BuildPlanner::new(
            &log,
            datastore.clone(),
            tracker,
            bus,
            renderer.clone(),
            PlannerConfig { render_scripts: true },
        );
        planner.plan_build(&env).await.unwrap();
        assert_eq!(renderer.rendered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revision_counts_prior_builds() {
        let log = rampart_test_utils::test_setup_log(
            "test_revision_counts_prior_builds",
        );
        let h = harness(&log, PlannerConfig::default());
        let env = two_host_environment(1);
        let first = h.planner.plan_build(&env).await.unwrap();
        let second = h.planner.plan_build(&env).await.unwrap();
        assert_eq!(first.build.revision, 0);
        assert_eq!(second.build.revision, 1);
        assert_eq!(second.commit.revision, 1);
    }
}
