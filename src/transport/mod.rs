//! Side-effecting half of a run.
//!
//! The controller owns the state machine and the audit log; a transport
//! owns everything that touches the outside world. [`LiveTransport`] clones,
//! builds and publishes for real. [`SimulatedTransport`] synthesizes
//! deterministic results for dry runs and tests.

mod live;
mod simulated;

pub use live::{LiveSettings, LiveTransport};
pub use simulated::{SimulatedTransport, SIMULATED_PR_NUMBER};

use crate::cancel::CancelSignal;
use crate::checks::StepReport;
use crate::credentials::BoxFuture;
use crate::error::ExecutionError;
use crate::model::{PublishedPr, WorkOrder};
use crate::redact::Redacted;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    Simulated,
}

/// Everything a transport needs to carry out one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub target_branch: String,
    pub source_branch: String,
    pub actor_id: String,
    pub work_orders: Vec<WorkOrder>,
    pub manifest: Redacted<String>,
    pub pr_title: Redacted<String>,
    pub pr_body: Redacted<String>,
}

/// Outcome of a checkout or apply step. Text is raw; the controller
/// redacts it before anything is stored.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub message: String,
    pub output: Option<String>,
    pub detail: Option<Value>,
}

impl PhaseReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub struct Publication {
    pub pr: PublishedPr,
    pub report: PhaseReport,
}

pub struct SessionStart {
    pub session: Box<dyn RunSession>,
    /// Logged under `AUTH`
    pub auth_message: String,
}

/// Opens one session per run.
pub trait ExecutionTransport: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Acquire credentials and prepare a session. No workspace exists yet.
    fn open_session<'a>(
        &'a self,
        plan: &'a RunPlan,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<SessionStart, ExecutionError>>;
}

/// The phases of one run, called in order. `close` is always called once a
/// session was opened, whatever the outcome.
pub trait RunSession: Send {
    fn checkout<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>>;

    fn apply<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<PhaseReport, ExecutionError>>;

    fn build<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>>;

    fn test<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<StepReport, ExecutionError>>;

    fn publish<'a>(&'a mut self, cancel: &'a CancelSignal)
        -> BoxFuture<'a, Result<Publication, ExecutionError>>;

    /// Release the workspace. Returns a message for the `CLEANUP` log.
    fn close(self: Box<Self>) -> anyhow::Result<String>;
}
