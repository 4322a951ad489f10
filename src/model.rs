//! Execution run, log and work-order records

use crate::error::{ErrorKind, StoreError};
use crate::redact::Redacted;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_TARGET_BRANCH: &str = "main";

/// Lifecycle of an execution run.
///
/// Runs move forward one step at a time, or jump to `Failed`. Terminal
/// states accept no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Cloning,
    Applying,
    Building,
    Testing,
    CreatingPr,
    Completed,
    Failed,
}

impl RunStatus {
    fn ordinal(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Cloning => 1,
            RunStatus::Applying => 2,
            RunStatus::Building => 3,
            RunStatus::Testing => 4,
            RunStatus::CreatingPr => 5,
            RunStatus::Completed => 6,
            RunStatus::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunStatus::Failed {
            return true;
        }
        next.ordinal() == self.ordinal() + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Cloning => "CLONING",
            RunStatus::Applying => "APPLYING",
            RunStatus::Building => "BUILDING",
            RunStatus::Testing => "TESTING",
            RunStatus::CreatingPr => "CREATING_PR",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase tag carried by every log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogPhase {
    Init,
    Gate,
    Auth,
    Clone,
    Apply,
    Build,
    Test,
    Pr,
    Cleanup,
    WorkOrders,
    Evidence,
    Complete,
    Error,
}

impl LogPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LogPhase::Init => "INIT",
            LogPhase::Gate => "GATE",
            LogPhase::Auth => "AUTH",
            LogPhase::Clone => "CLONE",
            LogPhase::Apply => "APPLY",
            LogPhase::Build => "BUILD",
            LogPhase::Test => "TEST",
            LogPhase::Pr => "PR",
            LogPhase::Cleanup => "CLEANUP",
            LogPhase::WorkOrders => "WORK_ORDERS",
            LogPhase::Evidence => "EVIDENCE",
            LogPhase::Complete => "COMPLETE",
            LogPhase::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub run_id: Uuid,
    /// 1-based position within the run
    pub sequence: u64,
    pub phase: LogPhase,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A log entry waiting to be appended. Message and detail are already
/// redacted; the store assigns sequence and timestamp.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub run_id: Uuid,
    pub phase: LogPhase,
    pub level: LogLevel,
    pub message: Redacted<String>,
    pub detail: Option<Redacted<Value>>,
}

impl NewLogEntry {
    /// Materialize the entry with the position and time chosen by a store.
    pub fn into_log(self, sequence: u64, created_at: DateTime<Utc>) -> ExecutionLog {
        ExecutionLog {
            run_id: self.run_id,
            sequence,
            phase: self.phase,
            level: self.level,
            message: self.message.into_inner(),
            detail: self.detail.map(Redacted::into_inner),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl WorkOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkOrderStatus::Pending => "PENDING",
            WorkOrderStatus::InProgress => "IN_PROGRESS",
            WorkOrderStatus::Completed => "COMPLETED",
            WorkOrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of approved work, produced upstream by the slicing pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: String,
    pub key: String,
    pub domain: String,
    pub title: String,
    #[serde(default)]
    pub spec: String,
    pub status: WorkOrderStatus,
}

impl WorkOrder {
    pub fn summary(&self) -> WorkOrderSummary {
        WorkOrderSummary {
            id: self.id.clone(),
            key: self.key.clone(),
            domain: self.domain.clone(),
            title: self.title.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderSummary {
    pub id: String,
    pub key: String,
    pub domain: String,
    pub title: String,
    pub status: WorkOrderStatus,
}

/// A recorded council gate decision for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// The pull request produced by a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPr {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub body: String,
}

/// One attempt to materialize a work-order set as a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub target_owner: String,
    pub target_repo: String,
    pub target_branch: String,
    pub source_branch: String,
    pub status: RunStatus,
    pub work_order_ids: Vec<String>,

    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,

    pub clone_log: Option<String>,
    pub apply_log: Option<String>,
    pub build_log: Option<String>,
    pub test_log: Option<String>,
    pub pr_log: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub evidence_path: Option<PathBuf>,

    pub actor_id: String,
    pub project_id: Option<String>,
    pub gate_decision_ref: Option<String>,
    /// Produced by the simulated transport
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which captured-output field a phase writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    Clone,
    Apply,
    Build,
    Test,
    Pr,
}

impl ExecutionRun {
    pub fn target_label(&self) -> String {
        format!(
            "{}/{}@{}",
            self.target_owner, self.target_repo, self.target_branch
        )
    }

    /// Advance to `next`, rejecting any move the state machine forbids.
    pub fn transition(&mut self, next: RunStatus, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn set_output(&mut self, slot: OutputSlot, output: Redacted<String>) {
        let value = Some(output.into_inner());
        match slot {
            OutputSlot::Clone => self.clone_log = value,
            OutputSlot::Apply => self.apply_log = value,
            OutputSlot::Build => self.build_log = value,
            OutputSlot::Test => self.test_log = value,
            OutputSlot::Pr => self.pr_log = value,
        }
    }

    /// Record the published pull request and move to `Completed`.
    pub fn complete(&mut self, pr: PublishedPr, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.transition(RunStatus::Completed, now)?;
        self.pr_number = Some(pr.number);
        self.pr_url = Some(pr.url);
        self.pr_title = Some(pr.title);
        self.pr_body = Some(pr.body);
        Ok(())
    }

    /// Move to `Failed` with an already redacted message.
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        message: Redacted<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(RunStatus::Failed, now)?;
        self.error = Some(message.into_inner());
        self.error_kind = Some(kind);
        Ok(())
    }

    /// Validate that `next` is an acceptable replacement for `self` in a store.
    ///
    /// Identity and payload never change. Status only moves along the state
    /// machine. Once terminal, status, result and error fields are frozen.
    pub fn check_update(&self, next: &ExecutionRun) -> Result<(), StoreError> {
        if self.id != next.id
            || self.work_order_ids != next.work_order_ids
            || self.created_at != next.created_at
        {
            return Err(StoreError::ImmutableField {
                run_id: self.id,
                field: "identity",
            });
        }
        if self.status.is_terminal() {
            let frozen = self.status == next.status
                && self.pr_number == next.pr_number
                && self.pr_url == next.pr_url
                && self.pr_title == next.pr_title
                && self.pr_body == next.pr_body
                && self.error == next.error
                && self.error_kind == next.error_kind
                && self.completed_at == next.completed_at;
            if !frozen {
                return Err(StoreError::TerminalRun {
                    run_id: self.id,
                    status: self.status,
                });
            }
            return Ok(());
        }
        if self.status != next.status && !self.status.can_transition_to(next.status) {
            return Err(StoreError::InvalidTransition {
                run_id: self.id,
                from: self.status,
                to: next.status,
            });
        }
        Ok(())
    }
}

/// Caller input for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub target_owner: String,
    pub target_repo: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    pub work_order_ids: Vec<String>,
    pub actor_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub gate_decision_ref: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        work_order_ids: Vec<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            target_owner: owner.into(),
            target_repo: repo.into(),
            target_branch: None,
            work_order_ids,
            actor_id: actor_id.into(),
            project_id: None,
            gate_decision_ref: None,
        }
    }

    pub fn with_target_branch(mut self, branch: impl Into<String>) -> Self {
        self.target_branch = Some(branch.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_gate_decision(mut self, decision_ref: impl Into<String>) -> Self {
        self.gate_decision_ref = Some(decision_ref.into());
        self
    }

    pub fn target_branch_or_default(&self) -> &str {
        self.target_branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_TARGET_BRANCH)
    }
}

/// Structured outcome returned to every caller. Nothing is thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_run_id: Option<Uuid>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionResult {
    /// Rejected before any run record existed.
    pub fn rejected(kind: ErrorKind, message: Redacted<String>) -> Self {
        Self {
            success: false,
            execution_run_id: None,
            pr_url: None,
            pr_number: None,
            error: Some(message.into_inner()),
            error_kind: Some(kind),
        }
    }

    pub fn from_run(run: &ExecutionRun) -> Self {
        Self {
            success: run.status == RunStatus::Completed,
            execution_run_id: Some(run.id),
            pr_url: run.pr_url.clone(),
            pr_number: run.pr_number,
            error: run.error.clone(),
            error_kind: run.error_kind,
        }
    }
}

/// A run with its full log and resolved work orders.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    pub run: ExecutionRun,
    pub logs: Vec<ExecutionLog>,
    pub work_orders: Vec<WorkOrderSummary>,
}

/// A run with its most recent log entries, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct RunOverview {
    pub run: ExecutionRun,
    pub recent_logs: Vec<ExecutionLog>,
}
