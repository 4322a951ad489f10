//! Error taxonomy for execution runs.

use crate::model::{LogPhase, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Coarse failure category surfaced to callers and persisted on the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input, rejected before any run record exists
    Validation,
    /// Project has no recorded gate decision
    GateBlocked,
    /// No credential for the acting user
    AuthMissing,
    /// Git, build tooling or the PR host failed
    ExternalFailure,
    Cancelled,
    Timeout,
    /// Run or log store failure
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::GateBlocked => "GATE_BLOCKED",
            ErrorKind::AuthMissing => "AUTH_MISSING",
            ErrorKind::ExternalFailure => "EXTERNAL_FAILURE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a requested work order cannot enter a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IneligibleWorkOrder {
    pub id: String,
    /// `None` when the id does not resolve
    pub status: Option<crate::model::WorkOrderStatus>,
}

impl fmt::Display for IneligibleWorkOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.id, status),
            None => write!(f, "{} (not found)", self.id),
        }
    }
}

fn join_ineligible(items: &[IneligibleWorkOrder]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of one execution, mapped onto [`ErrorKind`] for callers.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("At least one work order id is required")]
    NoWorkOrders,

    #[error(
        "Work orders not eligible for execution (must be PENDING): {}",
        join_ineligible(.0)
    )]
    IneligibleWorkOrders(Vec<IneligibleWorkOrder>),

    #[error("Council gate blocked execution for project {project_id}: {detail}")]
    GateBlocked { project_id: String, detail: String },

    #[error("No repository credential available for actor {actor_id}")]
    AuthMissing { actor_id: String },

    #[error("{phase} failed: {message}")]
    External { phase: LogPhase, message: String },

    #[error("Run cancelled during {phase}")]
    Cancelled { phase: LogPhase },

    #[error("{phase} timed out after {secs}s")]
    Timeout { phase: LogPhase, secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::MissingField { .. }
            | ExecutionError::InvalidField { .. }
            | ExecutionError::NoWorkOrders
            | ExecutionError::IneligibleWorkOrders(_) => ErrorKind::Validation,
            ExecutionError::GateBlocked { .. } => ErrorKind::GateBlocked,
            ExecutionError::AuthMissing { .. } => ErrorKind::AuthMissing,
            ExecutionError::External { .. } => ErrorKind::ExternalFailure,
            ExecutionError::Cancelled { .. } => ErrorKind::Cancelled,
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::Store(_) => ErrorKind::Internal,
        }
    }

    /// Wrap an adapter error, keeping its full cause chain in the message.
    pub fn external(phase: LogPhase, err: &anyhow::Error) -> Self {
        ExecutionError::External {
            phase,
            message: format!("{:#}", err),
        }
    }
}

/// Run/log store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("execution run already exists: {run_id}")]
    DuplicateRun { run_id: Uuid },

    #[error("work order not found: {id}")]
    WorkOrderNotFound { id: String },

    #[error("invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {run_id} is {status}; its outcome can no longer change")]
    TerminalRun { run_id: Uuid, status: RunStatus },

    #[error("run {run_id}: field {field} is immutable")]
    ImmutableField { run_id: Uuid, field: &'static str },

    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store record is malformed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock failed: {0}")]
    Lock(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Evidence bundle failures. These never change a run's outcome.
#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("run {run_id} is {status}; evidence is only written for completed runs")]
    NotCompleted { run_id: Uuid, status: RunStatus },

    #[error("evidence already exists at {}", .path.display())]
    AlreadyWritten { path: PathBuf },

    #[error("evidence write failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("evidence serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkOrderStatus;

    #[test]
    fn test_ineligible_message_names_ids_and_reasons() {
        let err = ExecutionError::IneligibleWorkOrders(vec![
            IneligibleWorkOrder {
                id: "wo1".into(),
                status: Some(WorkOrderStatus::InProgress),
            },
            IneligibleWorkOrder {
                id: "wo9".into(),
                status: None,
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Work orders not eligible for execution (must be PENDING): \
             wo1 (status IN_PROGRESS), wo9 (not found)"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            ExecutionError::AuthMissing {
                actor_id: "u".into()
            }
            .kind(),
            ErrorKind::AuthMissing
        );
        assert_eq!(
            ExecutionError::Timeout {
                phase: LogPhase::Build,
                secs: 3
            }
            .kind(),
            ErrorKind::Timeout
        );
        let store = StoreError::RunNotFound {
            run_id: Uuid::nil(),
        };
        assert_eq!(ExecutionError::from(store).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_external_keeps_cause_chain() {
        let err = anyhow::anyhow!("exit status 128").context("git clone failed");
        let wrapped = ExecutionError::external(LogPhase::Clone, &err);
        assert_eq!(
            wrapped.to_string(),
            "CLONE failed: git clone failed: exit status 128"
        );
    }

    #[test]
    fn test_kind_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::GateBlocked).unwrap(),
            "\"GATE_BLOCKED\""
        );
    }
}
