// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seam for the provisioning-script template renderer.
//!
//! Rendering is a planning-time side effect (writing per-host script
//! material somewhere the agent can fetch it).  The real renderer lives
//! outside this repository; whether it runs at all is an explicit
//! planner configuration value, not a global flag.

use async_trait::async_trait;
use rampart_common::Error;
use rampart_types::build::ProvisionedHost;
use rampart_types::build::ProvisioningStep;

#[async_trait]
pub trait StepRenderer: Send + Sync {
    /// Render whatever `step` needs on disk for `host`.  Called once
    /// per planned step, in chain order, when rendering is enabled.
    async fn render_step(
        &self,
        host: &ProvisionedHost,
        step: &ProvisioningStep,
    ) -> Result<(), Error>;
}

/// Renderer used when planning should have no render side effects.
#[derive(Debug, Default)]
pub struct NoopRenderer;

#[async_trait]
impl StepRenderer for NoopRenderer {
    async fn render_step(
        &self,
        _host: &ProvisionedHost,
        _step: &ProvisioningStep,
    ) -> Result<(), Error> {
        Ok(())
    }
}
