//! Persistence seams for runs, logs, work orders and gate decisions.
//!
//! The controller only talks to these traits. Two adapters ship with the
//! crate: [`MemoryStore`] for embedding and tests, [`FileStore`] for the CLI.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::model::{ExecutionLog, ExecutionRun, GateDecision, NewLogEntry, WorkOrder};
use uuid::Uuid;

/// Run records plus their append-only logs.
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: &ExecutionRun) -> Result<(), StoreError>;

    /// Replace a run, enforcing [`ExecutionRun::check_update`] against the
    /// stored version.
    fn update_run(&self, run: &ExecutionRun) -> Result<(), StoreError>;

    fn get_run(&self, run_id: Uuid) -> Result<Option<ExecutionRun>, StoreError>;

    /// Newest first, optionally restricted to a project.
    fn list_runs(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, StoreError>;

    /// Append a log entry. The store assigns the next sequence number and a
    /// timestamp no earlier than the previous entry's.
    fn append_log(&self, entry: NewLogEntry) -> Result<ExecutionLog, StoreError>;

    /// All entries for a run in sequence order.
    fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError>;

    /// The last `limit` entries for a run, still in sequence order.
    fn recent_logs(&self, run_id: Uuid, limit: usize) -> Result<Vec<ExecutionLog>, StoreError> {
        let mut logs = self.list_logs(run_id)?;
        if logs.len() > limit {
            logs.drain(..logs.len() - limit);
        }
        Ok(logs)
    }
}

/// Source of approved work orders.
pub trait WorkOrderSource: Send + Sync {
    /// Resolve ids. Unknown ids are simply absent from the result.
    fn get_work_orders(&self, ids: &[String]) -> Result<Vec<WorkOrder>, StoreError>;

    /// Bulk transition `PENDING -> IN_PROGRESS`. Orders already past
    /// `PENDING` are left alone. Returns how many changed.
    fn mark_in_progress(&self, ids: &[String]) -> Result<usize, StoreError>;
}

/// Lookup for council gate decisions.
pub trait GateRegistry: Send + Sync {
    fn decision_for_project(&self, project_id: &str) -> Result<Option<GateDecision>, StoreError>;
}

pub(crate) fn next_log_time(
    previous: Option<&ExecutionLog>,
    now: chrono::DateTime<chrono::Utc>,
) -> chrono::DateTime<chrono::Utc> {
    match previous {
        Some(prev) if prev.created_at > now => prev.created_at,
        _ => now,
    }
}

pub(crate) fn sort_newest_first(runs: &mut [ExecutionRun]) {
    runs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
