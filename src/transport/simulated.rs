//! Deterministic dry-run transport.
//!
//! Messages never mention the run id, the generated branch or the clock, so
//! two identical requests produce identical log sequences.

use super::{ExecutionMode, ExecutionTransport, PhaseReport, Publication, RunPlan, RunSession, SessionStart};
use crate::cancel::CancelSignal;
use crate::checks::{CheckKind, StepReport, StepStatus};
use crate::credentials::BoxFuture;
use crate::error::ExecutionError;
use crate::model::{LogPhase, PublishedPr};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIMULATED_PR_NUMBER: u64 = 999;

/// Dry-run transport. The builder methods inject failures and delays.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    failures: HashMap<LogPhase, String>,
    failing_checks: Vec<CheckKind>,
    phase_delay: Option<Duration>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `phase` fail with an external error carrying `message`.
    pub fn fail_at(mut self, phase: LogPhase, message: impl Into<String>) -> Self {
        self.failures.insert(phase, message.into());
        self
    }

    /// Report a non-zero exit for the build or test step.
    pub fn with_failing_check(mut self, kind: CheckKind) -> Self {
        self.failing_checks.push(kind);
        self
    }

    /// Sleep this long inside every phase.
    pub fn with_phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = Some(delay);
        self
    }

    pub fn opened_sessions(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ExecutionTransport for SimulatedTransport {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Simulated
    }

    fn open_session<'a>(
        &'a self,
        plan: &'a RunPlan,
        _cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<SessionStart, ExecutionError>> {
        Box::pin(async move {
            if let Some(message) = self.failures.get(&LogPhase::Auth) {
                return Err(ExecutionError::External {
                    phase: LogPhase::Auth,
                    message: message.clone(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(SessionStart {
                session: Box::new(SimulatedSession {
                    plan: plan.clone(),
                    transport: self.clone(),
                }),
                auth_message: "Simulation mode: credential lookup skipped".to_string(),
            })
        })
    }
}

struct SimulatedSession {
    plan: RunPlan,
    transport: SimulatedTransport,
}

impl SimulatedSession {
    async fn enter(&self, phase: LogPhase) -> Result<(), ExecutionError> {
        if let Some(delay) = self.transport.phase_delay {
            tokio::time::sleep(delay).await;
        }
        match self.transport.failures.get(&phase) {
            Some(message) => Err(ExecutionError::External {
                phase,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn check(&self, phase: LogPhase, kind: CheckKind) -> Result<StepReport, ExecutionError> {
        self.enter(phase).await?;
        if self.transport.failing_checks.contains(&kind) {
            return Ok(StepReport::simulated(
                kind,
                StepStatus::Failed { exit_code: Some(1) },
                &format!("simulated {} failure", kind.name()),
            ));
        }
        Ok(StepReport::simulated(kind, StepStatus::Passed, ""))
    }
}

impl RunSession for SimulatedSession {
    fn checkout<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>> {
        Box::pin(async move {
            self.enter(LogPhase::Clone).await?;
            Ok(PhaseReport::new(format!(
                "Simulated checkout of {}/{}@{}",
                self.plan.owner, self.plan.repo, self.plan.target_branch
            ))
            .with_output("simulated clone: no repository contacted"))
        })
    }

    fn apply<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>> {
        Box::pin(async move {
            self.enter(LogPhase::Apply).await?;
            let count = self.plan.work_orders.len();
            Ok(PhaseReport::new(format!(
                "Simulated change manifest for {} work order(s)",
                count
            ))
            .with_output(self.plan.manifest.as_str())
            .with_detail(json!({ "work_order_count": count })))
        })
    }

    fn build<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>> {
        Box::pin(self.check(LogPhase::Build, CheckKind::Build))
    }

    fn test<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>> {
        Box::pin(self.check(LogPhase::Test, CheckKind::Test))
    }

    fn publish<'a>(&'a mut self, _cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<Publication, ExecutionError>> {
        Box::pin(async move {
            self.enter(LogPhase::Pr).await?;
            let url = format!(
                "https://github.com/{}/{}/pull/{}",
                self.plan.owner, self.plan.repo, SIMULATED_PR_NUMBER
            );
            Ok(Publication {
                pr: PublishedPr {
                    number: SIMULATED_PR_NUMBER,
                    url,
                    title: self.plan.pr_title.as_str().to_string(),
                    body: self.plan.pr_body.as_str().to_string(),
                },
                report: PhaseReport::new(format!(
                    "Simulated pull request #{}",
                    SIMULATED_PR_NUMBER
                ))
                .with_output("simulated push: no remote contacted"),
            })
        })
    }

    fn close(self: Box<Self>) -> anyhow::Result<String> {
        self.transport.closed.fetch_add(1, Ordering::SeqCst);
        Ok("Simulated workspace released".to_string())
    }
}
