use super::{next_log_time, sort_newest_first, GateRegistry, RunStore, WorkOrderSource};
use crate::error::StoreError;
use crate::model::{
    ExecutionLog, ExecutionRun, GateDecision, NewLogEntry, WorkOrder, WorkOrderStatus,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, ExecutionRun>,
    logs: HashMap<Uuid, Vec<ExecutionLog>>,
    work_orders: HashMap<String, WorkOrder>,
    gates: HashMap<String, GateDecision>,
}

/// In-process store behind a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Lock("memory store mutex poisoned".to_string()))
    }

    pub fn put_work_order(&self, order: WorkOrder) -> Result<(), StoreError> {
        self.lock()?.work_orders.insert(order.id.clone(), order);
        Ok(())
    }

    pub fn put_gate_decision(&self, decision: GateDecision) -> Result<(), StoreError> {
        self.lock()?
            .gates
            .insert(decision.project_id.clone(), decision);
        Ok(())
    }

    pub fn work_order(&self, id: &str) -> Result<Option<WorkOrder>, StoreError> {
        Ok(self.lock()?.work_orders.get(id).cloned())
    }

    pub fn run_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.runs.len())
    }
}

impl RunStore for MemoryStore {
    fn insert_run(&self, run: &ExecutionRun) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateRun { run_id: run.id });
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn update_run(&self, run: &ExecutionRun) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let current = inner
            .runs
            .get(&run.id)
            .ok_or(StoreError::RunNotFound { run_id: run.id })?;
        current.check_update(run)?;
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<ExecutionRun>, StoreError> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    fn list_runs(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, StoreError> {
        let inner = self.lock()?;
        let mut runs: Vec<ExecutionRun> = inner
            .runs
            .values()
            .filter(|run| project_id.is_none_or(|p| run.project_id.as_deref() == Some(p)))
            .cloned()
            .collect();
        sort_newest_first(&mut runs);
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_log(&self, entry: NewLogEntry) -> Result<ExecutionLog, StoreError> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(&entry.run_id) {
            return Err(StoreError::RunNotFound {
                run_id: entry.run_id,
            });
        }
        let logs = inner.logs.entry(entry.run_id).or_default();
        let created_at = next_log_time(logs.last(), Utc::now());
        let log = entry.into_log(logs.len() as u64 + 1, created_at);
        logs.push(log.clone());
        Ok(log)
    }

    fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError> {
        Ok(self
            .lock()?
            .logs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl WorkOrderSource for MemoryStore {
    fn get_work_orders(&self, ids: &[String]) -> Result<Vec<WorkOrder>, StoreError> {
        let inner = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.work_orders.get(id).cloned())
            .collect())
    }

    fn mark_in_progress(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for id in ids {
            if let Some(order) = inner.work_orders.get_mut(id) {
                if order.status == WorkOrderStatus::Pending {
                    order.status = WorkOrderStatus::InProgress;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

impl GateRegistry for MemoryStore {
    fn decision_for_project(&self, project_id: &str) -> Result<Option<GateDecision>, StoreError> {
        Ok(self.lock()?.gates.get(project_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, LogPhase, RunStatus};
    use crate::redact::Redacted;

    fn run(project: Option<&str>) -> ExecutionRun {
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
            project_id: project.map(str::to_string),
            gate_decision_ref: None,
            simulated: true,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn entry(run_id: Uuid, message: &str) -> NewLogEntry {
        NewLogEntry {
            run_id,
            phase: LogPhase::Init,
            level: LogLevel::Info,
            message: Redacted::text(message),
            detail: None,
        }
    }

    #[test]
    fn test_log_sequence_is_dense_and_ordered() {
        let store = MemoryStore::new();
        let run = run(None);
        store.insert_run(&run).unwrap();
        for i in 0..5 {
            store.append_log(entry(run.id, &format!("m{}", i))).unwrap();
        }
        let logs = store.list_logs(run.id).unwrap();
        let seqs: Vec<u64> = logs.iter().map(|l| l.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(logs.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let recent = store.recent_logs(run.id, 2).unwrap();
        assert_eq!(recent[0].message, "m3");
        assert_eq!(recent[1].message, "m4");
    }

    #[test]
    fn test_append_log_requires_run() {
        let store = MemoryStore::new();
        assert!(store.append_log(entry(Uuid::new_v4(), "x")).is_err());
    }

    #[test]
    fn test_update_rejects_terminal_rewrite() {
        let store = MemoryStore::new();
        let mut run = run(None);
        store.insert_run(&run).unwrap();
        run.fail(
            crate::error::ErrorKind::Internal,
            Redacted::text("boom"),
            Utc::now(),
        )
        .unwrap();
        store.update_run(&run).unwrap();

        let mut rewrite = run.clone();
        rewrite.status = RunStatus::Completed;
        assert!(store.update_run(&rewrite).is_err());
    }

    #[test]
    fn test_list_runs_filters_and_limits() {
        let store = MemoryStore::new();
        let mut first = run(Some("p1"));
        first.created_at -= chrono::Duration::seconds(10);
        let second = run(Some("p1"));
        let other = run(Some("p2"));
        for r in [&first, &second, &other] {
            store.insert_run(r).unwrap();
        }
        let listed = store.list_runs(Some("p1"), 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(store.list_runs(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_in_progress_only_touches_pending() {
        let store = MemoryStore::new();
        for (id, status) in [
            ("a", WorkOrderStatus::Pending),
            ("b", WorkOrderStatus::Completed),
        ] {
            store
                .put_work_order(WorkOrder {
                    id: id.into(),
                    key: id.to_uppercase(),
                    domain: "api".into(),
                    title: "t".into(),
                    spec: String::new(),
                    status,
                })
                .unwrap();
        }
        let changed = store
            .mark_in_progress(&["a".into(), "b".into(), "missing".into()])
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(
            store.work_order("b").unwrap().unwrap().status,
            WorkOrderStatus::Completed
        );
    }
}
