//! JSON file store.
//!
//! Layout under the data directory:
//!
//! ```text
//! runs/<run-id>.json        one record per run, replaced atomically
//! logs/<run-id>.jsonl       append-only log, one entry per line
//! work_orders.json          work orders written by the slicing pipeline
//! gate_decisions.json       council gate decisions
//! .lock                     advisory lock shared by every process
//! ```

use super::{next_log_time, sort_newest_first, GateRegistry, RunStore, WorkOrderSource};
use crate::error::StoreError;
use crate::model::{
    ExecutionLog, ExecutionRun, GateDecision, NewLogEntry, WorkOrder, WorkOrderStatus,
};
use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

const RUNS_DIR: &str = "runs";
const LOGS_DIR: &str = "logs";
const WORK_ORDERS_FILE: &str = "work_orders.json";
const GATE_DECISIONS_FILE: &str = "gate_decisions.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 20;

pub struct FileStore {
    root: PathBuf,
    local: Mutex<()>,
}

struct StoreLock<'a> {
    file: fs::File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(RUNS_DIR), root.join(LOGS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self {
            root,
            local: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(RUNS_DIR).join(format!("{}.json", run_id))
    }

    fn log_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(LOGS_DIR).join(format!("{}.jsonl", run_id))
    }

    // Threads in this process serialize on the mutex; other processes on
    // the advisory file lock.
    fn lock(&self) -> Result<StoreLock<'_>, StoreError> {
        let local = self
            .local
            .lock()
            .map_err(|_| StoreError::Lock("file store mutex poisoned".to_string()))?;

        let lock_path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(StoreError::Lock(format!(
                            "timed out waiting for {} ({}s)",
                            lock_path.display(),
                            LOCK_TIMEOUT_SECS
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(err) => return Err(StoreError::io(&lock_path, err)),
            }
        }

        Ok(StoreLock {
            file,
            _local: local,
        })
    }

    pub fn put_work_order(&self, order: WorkOrder) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.root.join(WORK_ORDERS_FILE);
        let mut orders: Vec<WorkOrder> = read_json(&path)?.unwrap_or_default();
        orders.retain(|o| o.id != order.id);
        orders.push(order);
        write_json_atomic(&path, &orders)
    }

    pub fn put_gate_decision(&self, decision: GateDecision) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.root.join(GATE_DECISIONS_FILE);
        let mut decisions: Vec<GateDecision> = read_json(&path)?.unwrap_or_default();
        decisions.retain(|d| d.project_id != decision.project_id);
        decisions.push(decision);
        write_json_atomic(&path, &decisions)
    }

    fn load_work_orders(&self) -> Result<Vec<WorkOrder>, StoreError> {
        Ok(read_json(&self.root.join(WORK_ORDERS_FILE))?.unwrap_or_default())
    }
}

impl RunStore for FileStore {
    fn insert_run(&self, run: &ExecutionRun) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.run_path(run.id);
        if path.exists() {
            return Err(StoreError::DuplicateRun { run_id: run.id });
        }
        write_json_atomic(&path, run)
    }

    fn update_run(&self, run: &ExecutionRun) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.run_path(run.id);
        let current: ExecutionRun =
            read_json(&path)?.ok_or(StoreError::RunNotFound { run_id: run.id })?;
        current.check_update(run)?;
        write_json_atomic(&path, run)
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<ExecutionRun>, StoreError> {
        let _lock = self.lock()?;
        read_json(&self.run_path(run_id))
    }

    fn list_runs(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, StoreError> {
        let _lock = self.lock()?;
        let dir = self.root.join(RUNS_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run) = read_json::<ExecutionRun>(&path)? else {
                continue;
            };
            if project_id.is_none_or(|p| run.project_id.as_deref() == Some(p)) {
                runs.push(run);
            }
        }
        sort_newest_first(&mut runs);
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_log(&self, entry: NewLogEntry) -> Result<ExecutionLog, StoreError> {
        let _lock = self.lock()?;
        if !self.run_path(entry.run_id).exists() {
            return Err(StoreError::RunNotFound {
                run_id: entry.run_id,
            });
        }
        let path = self.log_path(entry.run_id);
        let existing: Vec<ExecutionLog> = read_jsonl(&path)?;
        let created_at = next_log_time(existing.last(), Utc::now());
        let log = entry.into_log(existing.len() as u64 + 1, created_at);
        append_jsonl(&path, &log)?;
        Ok(log)
    }

    fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError> {
        let _lock = self.lock()?;
        read_jsonl(&self.log_path(run_id))
    }
}

impl WorkOrderSource for FileStore {
    fn get_work_orders(&self, ids: &[String]) -> Result<Vec<WorkOrder>, StoreError> {
        let _lock = self.lock()?;
        let all = self.load_work_orders()?;
        Ok(ids
            .iter()
            .filter_map(|id| all.iter().find(|o| &o.id == id).cloned())
            .collect())
    }

    fn mark_in_progress(&self, ids: &[String]) -> Result<usize, StoreError> {
        let _lock = self.lock()?;
        let mut all = self.load_work_orders()?;
        let mut changed = 0;
        for order in all.iter_mut() {
            if order.status == WorkOrderStatus::Pending && ids.contains(&order.id) {
                order.status = WorkOrderStatus::InProgress;
                changed += 1;
            }
        }
        if changed > 0 {
            write_json_atomic(&self.root.join(WORK_ORDERS_FILE), &all)?;
        }
        Ok(changed)
    }
}

impl GateRegistry for FileStore {
    fn decision_for_project(&self, project_id: &str) -> Result<Option<GateDecision>, StoreError> {
        let _lock = self.lock()?;
        let decisions: Vec<GateDecision> =
            read_json(&self.root.join(GATE_DECISIONS_FILE))?.unwrap_or_default();
        Ok(decisions.into_iter().find(|d| d.project_id == project_id))
    }
}

// ============================================================================
// File helpers
// ============================================================================

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Write to a temp file, restrict permissions, then rename over the target.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|e| StoreError::io(&tmp_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

fn append_jsonl<T: Serialize>(path: &Path, row: &T) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(row)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, LogPhase, RunStatus};
    use crate::redact::Redacted;
    use tempfile::tempdir;

    fn run() -> ExecutionRun {
        let now = Utc::now();
        ExecutionRun {
            id: Uuid::new_v4(),
            target_owner: "acme".into(),
            target_repo: "app".into(),
            target_branch: "main".into(),
            source_branch: "council/x-1".into(),
            status: RunStatus::Pending,
            work_order_ids: vec!["wo1".into()],
            pr_number: None,
            pr_url: None,
            pr_title: None,
            pr_body: None,
            clone_log: None,
            apply_log: None,
            build_log: None,
            test_log: None,
            pr_log: None,
            error: None,
            error_kind: None,
            evidence_path: None,
            actor_id: "u1".into(),
            project_id: Some("p1".into()),
            gate_decision_ref: None,
            simulated: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_run_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut run = run();
        store.insert_run(&run).unwrap();
        assert!(store.insert_run(&run).is_err());

        run.transition(RunStatus::Cloning, Utc::now()).unwrap();
        store.update_run(&run).unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        let loaded = reopened.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Cloning);
        assert_eq!(reopened.list_runs(Some("p1"), 5).unwrap().len(), 1);
        assert!(reopened.list_runs(Some("p2"), 5).unwrap().is_empty());
    }

    #[test]
    fn test_logs_append_in_order() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let run = run();
        store.insert_run(&run).unwrap();
        for phase in [LogPhase::Init, LogPhase::Gate, LogPhase::Auth] {
            store
                .append_log(NewLogEntry {
                    run_id: run.id,
                    phase,
                    level: LogLevel::Info,
                    message: Redacted::text(phase.as_str()),
                    detail: None,
                })
                .unwrap();
        }
        let logs = store.list_logs(run.id).unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].sequence, 3);
        assert_eq!(logs[2].phase, LogPhase::Auth);
    }

    #[test]
    fn test_work_orders_and_gates() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .put_work_order(WorkOrder {
                id: "wo1".into(),
                key: "API-1".into(),
                domain: "api".into(),
                title: "Add endpoint".into(),
                spec: String::new(),
                status: WorkOrderStatus::Pending,
            })
            .unwrap();
        store
            .put_gate_decision(GateDecision {
                id: "gd1".into(),
                project_id: "p1".into(),
                summary: None,
                recorded_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.mark_in_progress(&["wo1".into()]).unwrap(), 1);
        let orders = store.get_work_orders(&["wo1".into(), "nope".into()]).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, WorkOrderStatus::InProgress);
        assert!(store.decision_for_project("p1").unwrap().is_some());
        assert!(store.decision_for_project("p2").unwrap().is_none());
    }
}
