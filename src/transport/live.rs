use super::{ExecutionMode, ExecutionTransport, PhaseReport, Publication, RunPlan, RunSession, SessionStart};
use crate::cancel::CancelSignal;
use crate::checks::{run_check, CheckKind, StepReport};
use crate::credentials::{AccessToken, BoxFuture, CredentialProvider};
use crate::error::ExecutionError;
use crate::github::PullRequestDraft;
use crate::model::LogPhase;
use crate::publisher::PrPublisher;
use crate::workspace::{Workspace, WorkspaceManager};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct LiveSettings {
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    /// Characters of build/test output kept per step
    pub output_limit: usize,
}

/// Clones, builds and publishes against the real host.
pub struct LiveTransport {
    workspaces: Arc<WorkspaceManager>,
    credentials: Arc<dyn CredentialProvider>,
    publisher: Arc<PrPublisher>,
    settings: LiveSettings,
}

impl LiveTransport {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        credentials: Arc<dyn CredentialProvider>,
        publisher: Arc<PrPublisher>,
        settings: LiveSettings,
    ) -> Self {
        Self {
            workspaces,
            credentials,
            publisher,
            settings,
        }
    }
}

impl ExecutionTransport for LiveTransport {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Live
    }

    fn open_session<'a>(
        &'a self,
        plan: &'a RunPlan,
        _cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<SessionStart, ExecutionError>> {
        Box::pin(async move {
            let token = self
                .credentials
                .token_for(&plan.actor_id)
                .await
                .map_err(|err| ExecutionError::external(LogPhase::Auth, &err))?
                .ok_or_else(|| ExecutionError::AuthMissing {
                    actor_id: plan.actor_id.clone(),
                })?;
            Ok(SessionStart {
                session: Box::new(LiveSession {
                    plan: plan.clone(),
                    token,
                    workspace: None,
                    workspaces: Arc::clone(&self.workspaces),
                    publisher: Arc::clone(&self.publisher),
                    settings: self.settings,
                }),
                auth_message: format!(
                    "Repository credential resolved via {}",
                    self.credentials.describe()
                ),
            })
        })
    }
}

struct LiveSession {
    plan: RunPlan,
    token: AccessToken,
    workspace: Option<Workspace>,
    workspaces: Arc<WorkspaceManager>,
    publisher: Arc<PrPublisher>,
    settings: LiveSettings,
}

impl LiveSession {
    fn workspace(&self, phase: LogPhase) -> Result<&Workspace, ExecutionError> {
        self.workspace.as_ref().ok_or_else(|| ExecutionError::External {
            phase,
            message: "workspace has not been checked out".to_string(),
        })
    }

    async fn check(
        &self,
        phase: LogPhase,
        kind: CheckKind,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<StepReport, ExecutionError> {
        let workspace = self.workspace(phase)?;
        run_check(
            workspace.path(),
            kind,
            timeout,
            self.settings.output_limit,
            cancel,
        )
        .await
        .map_err(|err| ExecutionError::external(phase, &err))
    }
}

impl RunSession for LiveSession {
    fn checkout<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>> {
        Box::pin(async move {
            let (workspace, output) = self
                .workspaces
                .checkout(
                    self.plan.run_id,
                    &self.plan.owner,
                    &self.plan.repo,
                    &self.plan.target_branch,
                    &self.plan.source_branch,
                    Some(self.token.clone()),
                    cancel,
                )
                .await
                .map_err(|err| ExecutionError::external(LogPhase::Clone, &err))?;
            self.workspace = Some(workspace);
            Ok(PhaseReport::new(format!(
                "Cloned {}/{}@{} and created branch {}",
                self.plan.owner, self.plan.repo, self.plan.target_branch, self.plan.source_branch
            ))
            .with_output(output))
        })
    }

    fn apply<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>> {
        Box::pin(async move {
            let workspace = self.workspace(LogPhase::Apply)?;
            let to_external = |err: anyhow::Error| ExecutionError::external(LogPhase::Apply, &err);
            let manifest: PathBuf = workspace
                .write_manifest(&self.plan.manifest)
                .map_err(to_external)?;
            let message = format!(
                "Apply {} council work order(s)\n\nExecution run: {}",
                self.plan.work_orders.len(),
                self.plan.run_id
            );
            let commit = workspace
                .commit_files(vec![manifest.clone()], message)
                .await
                .map_err(to_external)?;
            Ok(PhaseReport::new(format!(
                "Committed change manifest for {} work order(s)",
                self.plan.work_orders.len()
            ))
            .with_output(self.plan.manifest.as_str())
            .with_detail(json!({
                "commit": commit,
                "path": manifest.to_string_lossy(),
            })))
        })
    }

    fn build<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>> {
        let timeout = self.settings.build_timeout;
        Box::pin(self.check(LogPhase::Build, CheckKind::Build, timeout, cancel))
    }

    fn test<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>> {
        let timeout = self.settings.test_timeout;
        Box::pin(self.check(LogPhase::Test, CheckKind::Test, timeout, cancel))
    }

    fn publish<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<Publication, ExecutionError>> {
        Box::pin(async move {
            let workspace = self.workspace(LogPhase::Pr)?;
            let draft = PullRequestDraft {
                owner: self.plan.owner.clone(),
                repo: self.plan.repo.clone(),
                base: self.plan.target_branch.clone(),
                head: self.plan.source_branch.clone(),
                title: self.plan.pr_title.clone(),
                body: self.plan.pr_body.clone(),
            };
            let outcome = self
                .publisher
                .publish(workspace, &draft, &self.token, cancel)
                .await
                .map_err(|err| ExecutionError::external(LogPhase::Pr, &err))?;
            let report = PhaseReport::new(format!("Opened pull request #{}", outcome.pr.number))
                .with_output(outcome.push_output);
            Ok(Publication {
                pr: outcome.pr,
                report,
            })
        })
    }

    fn close(mut self: Box<Self>) -> anyhow::Result<String> {
        match self.workspace.take() {
            Some(mut workspace) => {
                let path = workspace.path().display().to_string();
                workspace.cleanup()?;
                Ok(format!("Removed workspace {}", path))
            }
            None => Ok("No workspace to remove".to_string()),
        }
    }
}
