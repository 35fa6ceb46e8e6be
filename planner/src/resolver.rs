// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-demand expansion of one team's host subtrees.
//!
//! Resolving a host may require hosts in other networks to exist first;
//! the resolver walks those declared dependencies with an explicit
//! frame stack rather than recursion, memoizes every (network, host)
//! pair it has finished, and keeps an in-progress set so a dependency
//! chain that re-enters itself fails as a cycle instead of looping.
//!
//! One resolver instance serves exactly one team and runs on that
//! team's planning task, so the memo map is also what makes redundant
//! invocation by multiple dependents idempotent: the first resolution
//! wins and later callers get the cached subtree.

use crate::PlanError;
use crate::PlannerConfig;
use crate::render::StepRenderer;
use rampart_common::address;
use rampart_datastore::Datastore;
use rampart_types::build::Build;
use rampart_types::build::ProvisionedHost;
use rampart_types::build::ProvisionedNetwork;
use rampart_types::build::ProvisioningStep;
use rampart_types::build::Team;
use rampart_types::environment::Environment;
use rampart_types::environment::HostTemplate;
use rampart_types::environment::NetworkTemplate;
use rampart_types::plan::PlanNode;
use rampart_types::plan::PlanPayload;
use rampart_types::HostUuid;
use rampart_types::NetworkUuid;
use rampart_types::PlanUuid;
use rampart_types::StepUuid;
use slog::Logger;
use slog::debug;
use slog::o;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What dependents need to know about a host that has been resolved.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedHost {
    pub host_id: HostUuid,
    /// The terminal node of the host's step chain; dependents put this
    /// in their `prev` set.
    pub end_step_plan: PlanUuid,
    pub end_step_number: u64,
}

#[derive(Clone, Debug)]
struct NetworkSlot {
    network: ProvisionedNetwork,
    node: PlanNode,
}

/// (network template name, host template name)
type HostKey = (String, String);

#[derive(Clone, Debug)]
struct Frame {
    network: String,
    host: String,
}

impl Frame {
    fn key(&self) -> HostKey {
        (self.network.clone(), self.host.clone())
    }

    fn label(&self) -> String {
        format!("{}/{}", self.network, self.host)
    }
}

pub(crate) struct HostResolver<'a> {
    datastore: &'a Arc<dyn Datastore>,
    renderer: &'a Arc<dyn StepRenderer>,
    config: &'a PlannerConfig,
    environment: &'a Environment,
    build: &'a Build,
    team: &'a Team,
    team_node: &'a PlanNode,
    networks: BTreeMap<String, NetworkSlot>,
    resolved: BTreeMap<HostKey, ResolvedHost>,
    in_progress: BTreeSet<HostKey>,
    log: Logger,
}

impl<'a> HostResolver<'a> {
    pub(crate) fn new(
        log: &Logger,
        datastore: &'a Arc<dyn Datastore>,
        renderer: &'a Arc<dyn StepRenderer>,
        config: &'a PlannerConfig,
        environment: &'a Environment,
        build: &'a Build,
        team: &'a Team,
        team_node: &'a PlanNode,
    ) -> HostResolver<'a> {
        HostResolver {
            datastore,
            renderer,
            config,
            environment,
            build,
            team,
            team_node,
            networks: BTreeMap::new(),
            resolved: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            log: log.new(o!(
                "component" => "HostResolver",
                "team_number" => team.team_number,
            )),
        }
    }

    /// Returns this team's provisioned copy of `template`, creating the
    /// network row and its plan node (downstream of the team milestone)
    /// on first use.
    pub(crate) async fn ensure_network(
        &mut self,
        template: &NetworkTemplate,
    ) -> Result<NetworkUuid, PlanError> {
        let slot = self.network_slot(template).await?;
        Ok(slot.network.id)
    }

    async fn network_slot(
        &mut self,
        template: &NetworkTemplate,
    ) -> Result<NetworkSlot, PlanError> {
        if let Some(slot) = self.networks.get(&template.name) {
            return Ok(slot.clone());
        }
        let network = self
            .datastore
            .network_create(ProvisionedNetwork {
                id: NetworkUuid::new_v4(),
                name: template.name.clone(),
                cidr: template.cidr.clone(),
                template: template.name.clone(),
                team_id: self.team.id,
                build_id: self.build.id,
            })
            .await?;
        let node = self
            .datastore
            .plan_create(PlanNode::child(
                self.build.id,
                PlanPayload::Network(network.id),
                &[self.team_node],
            ))
            .await?;
        debug!(
            self.log, "provisioned network planned";
            "network" => &template.name,
            "plan_id" => %node.id,
        );
        let slot = NetworkSlot { network, node };
        self.networks.insert(template.name.clone(), slot.clone());
        Ok(slot)
    }

    /// Produces (or returns the existing) provisioned-host subtree for
    /// `host` within `network`, resolving declared dependencies first.
    pub(crate) async fn resolve(
        &mut self,
        network: &str,
        host: &str,
    ) -> Result<ResolvedHost, PlanError> {
        let key: HostKey = (network.to_string(), host.to_string());
        if let Some(done) = self.resolved.get(&key) {
            return Ok(done.clone());
        }

        let mut stack: Vec<Frame> = Vec::new();
        self.push_frame(&mut stack, network, host)?;

        while let Some(top) = stack.last().cloned() {
            if let Some(dep) = self.first_unresolved_dependency(&top)? {
                let dep_key: HostKey =
                    (dep.network.clone(), dep.host.clone());
                if self.in_progress.contains(&dep_key) {
                    let mut chain: Vec<String> =
                        stack.iter().map(Frame::label).collect();
                    chain.push(format!("{}/{}", dep.network, dep.host));
                    return Err(PlanError::DependencyCycle { chain });
                }
                self.push_frame(&mut stack, &dep.network, &dep.host)?;
                continue;
            }
            self.materialize(&top).await?;
            self.in_progress.remove(&top.key());
            stack.pop();
        }

        // The memo map now holds the requested host; the loop above
        // cannot finish without materializing it.
        self.resolved.get(&key).cloned().ok_or_else(|| {
            PlanError::Datastore(rampart_common::Error::internal_error(
                format!("resolution finished without memoizing {host}"),
            ))
        })
    }

    fn push_frame(
        &mut self,
        stack: &mut Vec<Frame>,
        network: &str,
        host: &str,
    ) -> Result<(), PlanError> {
        // Both templates must exist before any rows are created.
        let unknown = || PlanError::UnknownDependencyTarget {
            host: host.to_string(),
            network: network.to_string(),
        };
        if self.environment.host(host).is_none() {
            return Err(unknown());
        }
        if self.environment.network(network).is_none() {
            return Err(unknown());
        }
        self.in_progress
            .insert((network.to_string(), host.to_string()));
        stack.push(Frame {
            network: network.to_string(),
            host: host.to_string(),
        });
        Ok(())
    }

    /// The first of `frame`'s declared dependencies that has not been
    /// memoized yet, if any.
    fn first_unresolved_dependency(
        &self,
        frame: &Frame,
    ) -> Result<Option<rampart_types::environment::HostDependency>, PlanError>
    {
        let template = self.host_template(frame)?;
        for dep in &template.depends_on {
            let dep_key: HostKey = (dep.network.clone(), dep.host.clone());
            if !self.resolved.contains_key(&dep_key) {
                return Ok(Some(dep.clone()));
            }
        }
        Ok(None)
    }

    fn host_template(
        &self,
        frame: &Frame,
    ) -> Result<&'a HostTemplate, PlanError> {
        self.environment.host(&frame.host).ok_or_else(|| {
            PlanError::UnknownDependencyTarget {
                host: frame.host.clone(),
                network: frame.network.clone(),
            }
        })
    }

    /// Creates the host row, its entry plan node, and its step chain.
    /// Every dependency of `frame` is already in the memo map.
    async fn materialize(&mut self, frame: &Frame) -> Result<(), PlanError> {
        let template = self.host_template(frame)?.clone();
        let network_template = self
            .environment
            .network(&frame.network)
            .ok_or_else(|| PlanError::UnknownDependencyTarget {
                host: frame.host.clone(),
                network: frame.network.clone(),
            })?
            .clone();
        let slot = self.network_slot(&network_template).await?;

        // Look aside at the datastore: a prior planning pass may have
        // produced this host already.
        if let Some(existing) = self
            .datastore
            .host_find(slot.network.id, &template.hostname)
            .await?
        {
            let end_step_plan =
                existing.end_step_plan.ok_or_else(|| {
                    PlanError::Datastore(
                        rampart_common::Error::internal_error(format!(
                            "host {} exists without an end step",
                            existing.id
                        )),
                    )
                })?;
            let end = self.datastore.plan_get(end_step_plan).await?;
            self.resolved.insert(
                frame.key(),
                ResolvedHost {
                    host_id: existing.id,
                    end_step_plan,
                    end_step_number: end.step_number,
                },
            );
            return Ok(());
        }

        let mut prev_ids: BTreeSet<PlanUuid> =
            BTreeSet::from([slot.node.id]);
        let mut max_prev_step = slot.node.step_number;
        for dep in &template.depends_on {
            let dep_key: HostKey = (dep.network.clone(), dep.host.clone());
            let resolved =
                self.resolved.get(&dep_key).ok_or_else(|| {
                    PlanError::UnknownDependencyTarget {
                        host: dep.host.clone(),
                        network: dep.network.clone(),
                    }
                })?;
            prev_ids.insert(resolved.end_step_plan);
            max_prev_step = max_prev_step.max(resolved.end_step_number);
        }

        let subnet_ip =
            address::subnet_ip(&slot.network.cidr, template.last_octet)
                .map_err(|error| PlanError::Address {
                    host: template.hostname.clone(),
                    error,
                })?;

        let host = self
            .datastore
            .host_create(ProvisionedHost {
                id: HostUuid::new_v4(),
                subnet_ip,
                template: template.hostname.clone(),
                network_id: slot.network.id,
                end_step_plan: None,
            })
            .await?;

        let entry = self
            .datastore
            .plan_create(PlanNode {
                id: PlanUuid::new_v4(),
                build_id: self.build.id,
                payload: PlanPayload::Host(host.id),
                step_number: 1 + max_prev_step,
                prev: prev_ids,
                next: BTreeSet::new(),
            })
            .await?;

        let mut last_node = entry;
        let bootstrap =
            template.bootstrap.iter().map(|p| (0u32, p.clone()));
        let declared = template
            .provision_steps
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32 + 1, p.clone()));
        for (step_number, payload) in bootstrap.chain(declared) {
            let step = self
                .datastore
                .step_create(ProvisioningStep {
                    id: StepUuid::new_v4(),
                    host_id: host.id,
                    step_number,
                    payload,
                })
                .await?;
            if self.config.render_scripts {
                self.renderer
                    .render_step(&host, &step)
                    .await
                    .map_err(|error| PlanError::Render {
                        host: template.hostname.clone(),
                        step: step.id,
                        error,
                    })?;
            }
            last_node = self
                .datastore
                .plan_create(PlanNode::child(
                    self.build.id,
                    PlanPayload::Step(step.id),
                    &[&last_node],
                ))
                .await?;
        }

        self.datastore
            .host_set_end_step(host.id, last_node.id)
            .await?;
        debug!(
            self.log, "provisioned host planned";
            "host" => &template.hostname,
            "network" => &frame.network,
            "subnet_ip" => %subnet_ip,
            "end_step" => %last_node.id,
        );
        self.resolved.insert(
            frame.key(),
            ResolvedHost {
                host_id: host.id,
                end_step_plan: last_node.id,
                end_step_number: last_node.step_number,
            },
        );
        Ok(())
    }
}
