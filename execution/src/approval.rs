// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The approval-workflow collaborator.
//!
//! A freshly planned build is snapshotted as a commit and reviewed
//! before any infrastructure action dispatches.  The real reviewer is
//! a person behind an API; the orchestrator only sees this trait and
//! bounds the wait with its configured timeout.

use async_trait::async_trait;
use rampart_common::Error;
use rampart_types::build::BuildCommit;

/// The reviewer's verdict on a build commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

#[async_trait]
pub trait CommitReviewer: Send + Sync {
    /// Blocks until `commit` has been reviewed.  The caller applies
    /// the timeout; implementations may wait indefinitely.
    async fn wait_for_review(
        &self,
        commit: &BuildCommit,
    ) -> Result<ReviewDecision, Error>;
}

/// Approves every commit immediately.  Useful for unattended
/// deployments and tests.
#[derive(Debug, Default)]
pub struct AutoApprover;

#[async_trait]
impl CommitReviewer for AutoApprover {
    async fn wait_for_review(
        &self,
        _commit: &BuildCommit,
    ) -> Result<ReviewDecision, Error> {
        Ok(ReviewDecision::Approved)
    }
}
