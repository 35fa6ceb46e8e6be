// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative environment templates.
//!
//! An [`Environment`] is the parsed form of a competition range
//! definition: the networks it contains, the host templates those
//! networks include, and the provisioning steps each host runs.  The
//! configuration-language parser that produces these lives outside this
//! repository; everything here is plain data.

use crate::typed_uuid::EnvironmentUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// One complete range definition, pinned at a revision.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Environment {
    pub id: EnvironmentUuid,
    pub name: String,
    /// Bumped by the configuration layer each time the definition
    /// changes; builds snapshot the revision they were planned from.
    pub revision: u32,
    /// Number of isolated team copies a build of this environment
    /// materializes.
    pub team_count: u32,
    pub networks: Vec<NetworkTemplate>,
    pub hosts: Vec<HostTemplate>,
}

impl Environment {
    /// Looks up a declared network template by name.
    pub fn network(&self, name: &str) -> Option<&NetworkTemplate> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// Looks up a declared host template by hostname.
    pub fn host(&self, hostname: &str) -> Option<&HostTemplate> {
        self.hosts.iter().find(|h| h.hostname == hostname)
    }
}

/// A network to be provisioned once per team.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NetworkTemplate {
    pub name: String,
    /// IPv4 CIDR, copied verbatim onto each provisioned copy.
    pub cidr: String,
    /// Hostnames of the templates instantiated inside this network.
    pub included_hosts: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A host to be provisioned once per (team, network) that includes it.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct HostTemplate {
    pub hostname: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Operating-system tag consumed by the concrete builder.
    pub os: String,
    /// Offset into the owning network's subnet; the allocator adds this
    /// to the network base address without bound checks.
    pub last_octet: u32,
    /// Hosts (possibly in other networks) that must be fully provisioned
    /// before this one starts.
    #[serde(default)]
    pub depends_on: Vec<HostDependency>,
    /// Optional bootstrap step, planned as step 0 ahead of the declared
    /// list.
    #[serde(default)]
    pub bootstrap: Option<StepPayload>,
    /// Ordered provisioning steps run on the host after it exists.
    #[serde(default)]
    pub provision_steps: Vec<StepPayload>,
}

/// A cross-network dependency edge between host templates.
#[derive(
    Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
    JsonSchema,
)]
pub struct HostDependency {
    /// Hostname of the target template.
    pub host: String,
    /// Name of the network template the target is provisioned in.
    pub network: String,
}

/// The kind of work a provisioning step performs.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Script,
    Command,
    FileDownload,
    FileExtract,
    FileDelete,
    DnsRecord,
}

/// The typed payload of one provisioning step.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepPayload {
    /// Upload and run a script from the environment's source tree.
    Script { source: String, args: Vec<String> },
    /// Run a single command already present on the host.
    Command { program: String, args: Vec<String> },
    /// Fetch a file onto the host.
    FileDownload { source_url: String, destination: String },
    /// Unpack a previously downloaded archive.
    FileExtract { archive: String, destination: String },
    /// Remove a path from the host.
    FileDelete { path: String },
    /// Publish a DNS record for the host.
    DnsRecord {
        name: String,
        record_type: String,
        values: Vec<String>,
        zone: String,
    },
}

impl StepPayload {
    pub fn step_type(&self) -> StepType {
        match self {
            StepPayload::Script { .. } => StepType::Script,
            StepPayload::Command { .. } => StepType::Command,
            StepPayload::FileDownload { .. } => StepType::FileDownload,
            StepPayload::FileExtract { .. } => StepType::FileExtract,
            StepPayload::FileDelete { .. } => StepType::FileDelete,
            StepPayload::DnsRecord { .. } => StepType::DnsRecord,
        }
    }
}
