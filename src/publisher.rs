//! Push the source branch, then open the pull request.

use crate::cancel::CancelSignal;
use crate::credentials::AccessToken;
use crate::github::{PullRequestDraft, PullRequestHost};
use crate::model::PublishedPr;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct PublishOutcome {
    pub pr: PublishedPr,
    pub push_output: String,
}

pub struct PrPublisher {
    host: Arc<dyn PullRequestHost>,
}

impl PrPublisher {
    pub fn new(host: Arc<dyn PullRequestHost>) -> Self {
        Self { host }
    }

    /// Fails without contacting the host when the branch has nothing to
    /// push or the push is rejected.
    pub async fn publish(
        &self,
        workspace: &Workspace,
        draft: &PullRequestDraft,
        token: &AccessToken,
        cancel: &CancelSignal,
    ) -> Result<PublishOutcome> {
        let push_output = workspace
            .push(cancel)
            .await
            .with_context(|| format!("Failed to push '{}'", workspace.source_branch()))?;
        let pr = self
            .host
            .open_pull_request(draft, token)
            .await
            .context("Failed to open pull request")?;
        Ok(PublishOutcome { pr, push_output })
    }
}
