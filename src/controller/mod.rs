//! Execution run orchestration.
//!
//! The controller validates a request, creates the run record and then walks
//! the run through its phases on a [`RunSession`] opened by the injected
//! [`ExecutionTransport`]. It owns the state machine and the audit log and
//! turns every failure into an [`ExecutionResult`]; nothing escapes to the
//! caller as an error.
//!
//! Phase order for a successful run:
//!
//! ```text
//! INIT → GATE → AUTH → CLONE → APPLY → BUILD → TEST → PR
//!      → CLEANUP → WORK_ORDERS → EVIDENCE → COMPLETE
//! ```
//!
//! A failed run ends with `CLEANUP` (when a session was opened) and `ERROR`.

mod naming;

pub use naming::source_branch;

use crate::cancel::{cancel_pair, guarded, CancelHandle, CancelSignal, Interrupted};
use crate::checks::{BuildFailurePolicy, CheckKind, Procedure, StepReport, StepStatus};
use crate::config::{Config, PhaseTimeouts};
use crate::error::{ErrorKind, ExecutionError, IneligibleWorkOrder, StoreError};
use crate::evidence::EvidenceWriter;
use crate::github::{render_body, render_title};
use crate::model::{
    ExecutionRequest, ExecutionResult, ExecutionRun, GateDecision, LogLevel, LogPhase,
    NewLogEntry, OutputSlot, PublishedPr, RunDetails, RunOverview, RunStatus, WorkOrder,
    WorkOrderStatus, WorkOrderSummary,
};
use crate::redact::Redacted;
use crate::store::{GateRegistry, RunStore, WorkOrderSource};
use crate::transport::{ExecutionMode, ExecutionTransport, PhaseReport, RunPlan, RunSession};
use crate::workspace::is_valid_repo_segment;
use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SEGMENT_RULE: &str = "use letters, digits, '-', '_' or '.'";

/// The three persistence seams the controller reads and writes.
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub work_orders: Arc<dyn WorkOrderSource>,
    pub gates: Arc<dyn GateRegistry>,
}

impl Stores {
    /// Use one store for runs, work orders and gate decisions.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RunStore + WorkOrderSource + GateRegistry + 'static,
    {
        Self {
            runs: store.clone(),
            work_orders: store.clone(),
            gates: store,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub timeouts: PhaseTimeouts,
    pub build_failure_policy: BuildFailurePolicy,
    /// Log entries attached to each run in listings
    pub recent_log_limit: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            timeouts: PhaseTimeouts::default(),
            build_failure_policy: BuildFailurePolicy::default(),
            recent_log_limit: 5,
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeouts: config.timeouts,
            build_failure_policy: config.build_failure_policy,
            recent_log_limit: config.recent_log_limit,
        }
    }
}

/// One async mutex per publish target, so two runs never race a push to the
/// same branch from this process.
#[derive(Default)]
struct PushLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PushLocks {
    async fn acquire(&self, target: String) -> PushPermit<'_> {
        let lock = {
            let mut locks = lock_ignoring_poison(&self.locks);
            Arc::clone(locks.entry(target.clone()).or_default())
        };
        PushPermit {
            locks: self,
            target,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_ignoring_poison(&self.locks).len()
    }
}

/// Held for the publish phase. The target's entry is dropped with the last
/// permit or waiter.
struct PushPermit<'a> {
    locks: &'a PushLocks,
    target: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PushPermit<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_ignoring_poison(&self.locks.locks);
        if locks
            .get(&self.target)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.target);
        }
    }
}

type ActiveRuns = Arc<Mutex<HashMap<Uuid, CancelHandle>>>;

/// Keeps a run cancellable through [`ExecutionController::cancel`] until
/// dropped.
struct ActiveRun {
    active: ActiveRuns,
    run_id: Uuid,
}

impl ActiveRun {
    fn register(active: &ActiveRuns, run_id: Uuid, handle: CancelHandle) -> Self {
        lock_ignoring_poison(active).insert(run_id, handle);
        Self {
            active: Arc::clone(active),
            run_id,
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock_ignoring_poison(&self.active).remove(&self.run_id);
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A run driven on its own task by [`ExecutionController::start`].
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancelHandle,
    task: JoinHandle<ExecutionResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Returns `false` if already requested.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub async fn wait(self) -> ExecutionResult {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                let mut result = ExecutionResult::rejected(
                    ErrorKind::Internal,
                    Redacted::text(&format!("Run task ended abnormally: {}", err)),
                );
                result.execution_run_id = Some(self.run_id);
                result
            }
        }
    }
}

/// A validated request with its freshly inserted run record.
struct Prepared {
    run: ExecutionRun,
    plan: RunPlan,
}

/// Request fields after trimming and defaulting.
struct ValidRequest {
    owner: String,
    repo: String,
    target_branch: String,
    actor_id: String,
    project_id: Option<String>,
    gate_decision_ref: Option<String>,
    work_order_ids: Vec<String>,
}

pub struct ExecutionController {
    runs: Arc<dyn RunStore>,
    work_orders: Arc<dyn WorkOrderSource>,
    gates: Arc<dyn GateRegistry>,
    transport: Arc<dyn ExecutionTransport>,
    evidence: Option<EvidenceWriter>,
    settings: ControllerSettings,
    push_locks: PushLocks,
    active: ActiveRuns,
}

impl ExecutionController {
    pub fn new(stores: Stores, transport: Arc<dyn ExecutionTransport>) -> Self {
        Self {
            runs: stores.runs,
            work_orders: stores.work_orders,
            gates: stores.gates,
            transport,
            evidence: None,
            settings: ControllerSettings::default(),
            push_locks: PushLocks::default(),
            active: ActiveRuns::default(),
        }
    }

    /// Write an evidence bundle after every successful run.
    pub fn with_evidence(mut self, writer: EvidenceWriter) -> Self {
        self.evidence = Some(writer);
        self
    }

    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.transport.mode()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Validate, create the run record and drive it to a terminal state.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let prepared = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(rejected) => return rejected,
        };
        let (handle, signal) = cancel_pair();
        let _active = ActiveRun::register(&self.active, prepared.run.id, handle);
        self.drive(prepared, signal).await
    }

    /// Validate and create the record now, then drive the run on its own
    /// task. A rejected request never spawns anything.
    pub fn start(self: &Arc<Self>, request: ExecutionRequest) -> Result<RunHandle, ExecutionResult> {
        let prepared = self.prepare(request)?;
        let run_id = prepared.run.id;
        let (handle, signal) = cancel_pair();
        let active = ActiveRun::register(&self.active, run_id, handle.clone());
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _active = active;
            controller.drive(prepared, signal).await
        });
        Ok(RunHandle {
            run_id,
            cancel: handle,
            task,
        })
    }

    /// Signal a run still in flight in this process.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let active = lock_ignoring_poison(&self.active);
        match active.get(&run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A run with its full log and the work orders it consumed.
    pub fn get_run(&self, run_id: Uuid) -> Result<Option<RunDetails>, StoreError> {
        let Some(run) = self.runs.get_run(run_id)? else {
            return Ok(None);
        };
        let logs = self.runs.list_logs(run_id)?;
        let work_orders = self.summaries_for(&run.work_order_ids)?;
        Ok(Some(RunDetails {
            run,
            logs,
            work_orders,
        }))
    }

    /// Newest runs first, each with its most recent log entries.
    pub fn list_recent_runs(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunOverview>, StoreError> {
        self.runs
            .list_runs(project_id, limit)?
            .into_iter()
            .map(|run| {
                let recent_logs = self
                    .runs
                    .recent_logs(run.id, self.settings.recent_log_limit)?;
                Ok(RunOverview { run, recent_logs })
            })
            .collect()
    }

    /// Move work orders of completed live runs to `IN_PROGRESS` where the
    /// post-completion update never landed. Returns how many changed.
    pub fn reconcile_work_orders(&self) -> Result<usize, StoreError> {
        let mut changed = 0;
        for run in self.runs.list_runs(None, usize::MAX)? {
            if run.status != RunStatus::Completed || run.simulated {
                continue;
            }
            let pending: Vec<String> = self
                .work_orders
                .get_work_orders(&run.work_order_ids)?
                .into_iter()
                .filter(|order| order.status == WorkOrderStatus::Pending)
                .map(|order| order.id)
                .collect();
            if pending.is_empty() {
                continue;
            }
            let count = self.work_orders.mark_in_progress(&pending)?;
            if count > 0 {
                tracing::info!(run_id = %run.id, count, "Reconciled work order status");
            }
            changed += count;
        }
        Ok(changed)
    }

    /// Orders in the run's id order. Orders deleted since are omitted.
    fn orders_for(&self, ids: &[String]) -> Result<Vec<WorkOrder>, StoreError> {
        let mut by_id: HashMap<String, WorkOrder> = self
            .work_orders
            .get_work_orders(ids)?
            .into_iter()
            .map(|order| (order.id.clone(), order))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    fn summaries_for(&self, ids: &[String]) -> Result<Vec<WorkOrderSummary>, StoreError> {
        Ok(self.orders_for(ids)?.iter().map(WorkOrder::summary).collect())
    }

    // ========================================================================
    // Validation and record creation
    // ========================================================================

    fn prepare(&self, request: ExecutionRequest) -> Result<Prepared, ExecutionResult> {
        let reject = |err: ExecutionError| {
            tracing::warn!(kind = %err.kind(), "Execution request rejected: {}", Redacted::display(&err).as_str());
            ExecutionResult::rejected(err.kind(), Redacted::display(&err))
        };

        let request = validate_request(&request).map_err(reject)?;
        let orders = self.resolve_work_orders(&request.work_order_ids).map_err(reject)?;

        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let source_branch = naming::source_branch(&orders, millis);
        let manifest = Redacted::serialize(&json!({
            "execution_run_id": run_id,
            "work_orders": orders,
        }))
        .to_pretty();

        let run = ExecutionRun {
            id: run_id,
            target_owner: request.owner.clone(),
            target_repo: request.repo.clone(),
            target_branch: request.target_branch.clone(),
            source_branch: source_branch.clone(),
            status: RunStatus::Pending,
            work_order_ids: request.work_order_ids.clone(),
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
            actor_id: request.actor_id.clone(),
            project_id: request.project_id.clone(),
            gate_decision_ref: request.gate_decision_ref.clone(),
            simulated: self.transport.mode() == ExecutionMode::Simulated,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.runs
            .insert_run(&run)
            .map_err(|err| reject(err.into()))?;

        let plan = RunPlan {
            run_id,
            owner: request.owner,
            repo: request.repo,
            target_branch: request.target_branch,
            source_branch,
            actor_id: request.actor_id,
            pr_title: render_title(&orders),
            pr_body: render_body(run_id, &orders, request.gate_decision_ref.as_deref()),
            manifest,
            work_orders: orders,
        };
        Ok(Prepared { run, plan })
    }

    /// Every id must resolve to a `PENDING` order. Returned in request order.
    fn resolve_work_orders(&self, ids: &[String]) -> Result<Vec<WorkOrder>, ExecutionError> {
        let mut by_id: HashMap<String, WorkOrder> = self
            .work_orders
            .get_work_orders(ids)?
            .into_iter()
            .map(|order| (order.id.clone(), order))
            .collect();

        let mut orders = Vec::with_capacity(ids.len());
        let mut ineligible = Vec::new();
        for id in ids {
            match by_id.remove(id) {
                Some(order) if order.status == WorkOrderStatus::Pending => orders.push(order),
                Some(order) => ineligible.push(IneligibleWorkOrder {
                    id: id.clone(),
                    status: Some(order.status),
                }),
                None => ineligible.push(IneligibleWorkOrder {
                    id: id.clone(),
                    status: None,
                }),
            }
        }
        if !ineligible.is_empty() {
            return Err(ExecutionError::IneligibleWorkOrders(ineligible));
        }
        Ok(orders)
    }

    // ========================================================================
    // Driving a run
    // ========================================================================

    async fn drive(&self, prepared: Prepared, cancel: CancelSignal) -> ExecutionResult {
        let Prepared { mut run, plan } = prepared;
        let mut session: Option<Box<dyn RunSession>> = None;

        let outcome = self
            .run_phases(&mut run, &plan, &mut session, &cancel)
            .await;

        if let Some(session) = session.take() {
            self.close_session(run.id, session);
        }

        match outcome {
            Ok(pr) => self.finish_success(run, &plan, pr),
            Err(err) => self.finish_failure(run, err),
        }
    }

    async fn run_phases(
        &self,
        run: &mut ExecutionRun,
        plan: &RunPlan,
        slot: &mut Option<Box<dyn RunSession>>,
        cancel: &CancelSignal,
    ) -> Result<PublishedPr, ExecutionError> {
        self.record(
            run.id,
            LogPhase::Init,
            LogLevel::Info,
            &format!(
                "Execution requested for {} work order(s) against {}",
                run.work_order_ids.len(),
                run.target_label()
            ),
            Some(json!({
                "work_order_ids": run.work_order_ids,
                "mode": self.transport.mode(),
            })),
        )?;

        self.check_gate(run)?;

        let start = self
            .guard(LogPhase::Auth, cancel, self.transport.open_session(plan, cancel))
            .await?;
        let session = slot.insert(start.session);
        self.info(run.id, LogPhase::Auth, &start.auth_message)?;

        // CLONE
        self.advance(run, RunStatus::Cloning)?;
        self.info(
            run.id,
            LogPhase::Clone,
            &format!("Checking out {}", run.target_label()),
        )?;
        let report = self
            .guard(LogPhase::Clone, cancel, session.checkout(cancel))
            .await?;
        self.record_phase(run, LogPhase::Clone, OutputSlot::Clone, report)?;

        // APPLY
        self.advance(run, RunStatus::Applying)?;
        self.info(
            run.id,
            LogPhase::Apply,
            &format!("Applying {} work order(s)", plan.work_orders.len()),
        )?;
        let report = self
            .guard(LogPhase::Apply, cancel, session.apply(cancel))
            .await?;
        self.record_phase(run, LogPhase::Apply, OutputSlot::Apply, report)?;

        // BUILD
        self.advance(run, RunStatus::Building)?;
        self.info(run.id, LogPhase::Build, "Running build procedure")?;
        let report = self
            .guard(LogPhase::Build, cancel, session.build(cancel))
            .await?;
        self.record_step(run, CheckKind::Build, &report)?;

        // TEST
        self.advance(run, RunStatus::Testing)?;
        self.info(run.id, LogPhase::Test, "Running test procedure")?;
        let report = self
            .guard(LogPhase::Test, cancel, session.test(cancel))
            .await?;
        self.record_step(run, CheckKind::Test, &report)?;

        // PR
        self.advance(run, RunStatus::CreatingPr)?;
        self.info(
            run.id,
            LogPhase::Pr,
            &format!("Publishing pull request against {}", run.target_label()),
        )?;
        let target = run.target_label();
        let publication = self
            .guard(LogPhase::Pr, cancel, async {
                let _permit = self.push_locks.acquire(target).await;
                session.publish(cancel).await
            })
            .await?;
        if let Some(output) = &publication.report.output {
            run.set_output(OutputSlot::Pr, Redacted::text(output));
            self.runs.update_run(run)?;
        }
        self.record(
            run.id,
            LogPhase::Pr,
            LogLevel::Info,
            &publication.report.message,
            Some(json!({
                "number": publication.pr.number,
                "url": publication.pr.url,
            })),
        )?;
        Ok(publication.pr)
    }

    fn check_gate(&self, run: &ExecutionRun) -> Result<(), ExecutionError> {
        let Some(project_id) = run.project_id.as_deref() else {
            self.info(run.id, LogPhase::Gate, "No project scope; gate check not required")?;
            return Ok(());
        };
        let decision = self.gates.decision_for_project(project_id)?;
        let decision = gate_decision_matches(project_id, decision, run.gate_decision_ref.as_deref())?;
        self.record(
            run.id,
            LogPhase::Gate,
            LogLevel::Info,
            &format!(
                "Council gate decision {} found for project {}",
                decision.id, project_id
            ),
            Some(json!({
                "decision_id": decision.id,
                "recorded_at": decision.recorded_at,
            })),
        )?;
        Ok(())
    }

    /// Race a phase against its time limit and the run's cancellation.
    async fn guard<T, F>(
        &self,
        phase: LogPhase,
        cancel: &CancelSignal,
        fut: F,
    ) -> Result<T, ExecutionError>
    where
        F: Future<Output = Result<T, ExecutionError>>,
    {
        let limit = self.settings.timeouts.for_phase(phase);
        match guarded(cancel, limit, fut).await {
            Ok(result) => result,
            Err(Interrupted::Cancelled) => Err(ExecutionError::Cancelled { phase }),
            Err(Interrupted::TimedOut) => Err(ExecutionError::Timeout {
                phase,
                secs: limit.as_secs(),
            }),
        }
    }

    fn advance(&self, run: &mut ExecutionRun, next: RunStatus) -> Result<(), ExecutionError> {
        run.transition(next, Utc::now())?;
        self.runs.update_run(run)?;
        Ok(())
    }

    fn record_phase(
        &self,
        run: &mut ExecutionRun,
        phase: LogPhase,
        slot: OutputSlot,
        report: PhaseReport,
    ) -> Result<(), ExecutionError> {
        if let Some(output) = &report.output {
            run.set_output(slot, Redacted::text(output));
            self.runs.update_run(run)?;
        }
        self.record(run.id, phase, LogLevel::Info, &report.message, report.detail)?;
        Ok(())
    }

    /// Store a build or test report. Failures only stop the run under
    /// [`BuildFailurePolicy::Block`].
    fn record_step(
        &self,
        run: &mut ExecutionRun,
        kind: CheckKind,
        report: &StepReport,
    ) -> Result<(), ExecutionError> {
        let (phase, slot) = match kind {
            CheckKind::Build => (LogPhase::Build, OutputSlot::Build),
            CheckKind::Test => (LogPhase::Test, OutputSlot::Test),
        };
        run.set_output(slot, Redacted::text(&report.output));
        self.runs.update_run(run)?;

        let summary = report.summary();
        let detail = json!({
            "procedure": report.procedure.as_ref().map(Procedure::label),
            "result": report.status,
            "duration_ms": report.duration_ms,
        });

        if report.is_failure() {
            return match self.settings.build_failure_policy {
                BuildFailurePolicy::Tolerate => {
                    self.record(
                        run.id,
                        phase,
                        LogLevel::Warn,
                        &format!("{}; continuing", summary),
                        Some(detail),
                    )?;
                    Ok(())
                }
                BuildFailurePolicy::Block => {
                    self.record(run.id, phase, LogLevel::Error, &summary, Some(detail))?;
                    Err(ExecutionError::External {
                        phase,
                        message: summary,
                    })
                }
            };
        }

        let level = match (&report.status, kind) {
            (StepStatus::Skipped, CheckKind::Test) => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        self.record(run.id, phase, level, &summary, Some(detail))?;
        Ok(())
    }

    fn close_session(&self, run_id: Uuid, session: Box<dyn RunSession>) {
        match session.close() {
            Ok(message) => self.record_best_effort(run_id, LogPhase::Cleanup, LogLevel::Info, &message, None),
            Err(err) => self.record_best_effort(
                run_id,
                LogPhase::Cleanup,
                LogLevel::Warn,
                &format!("Workspace cleanup failed: {:#}", err),
                None,
            ),
        }
    }

    fn finish_success(&self, run: ExecutionRun, plan: &RunPlan, pr: PublishedPr) -> ExecutionResult {
        let mut completed = run.clone();
        let stored = completed
            .complete(pr, Utc::now())
            .and_then(|()| self.runs.update_run(&completed));
        if let Err(err) = stored {
            return self.finish_failure(run, err.into());
        }

        self.update_work_orders(&completed);
        self.write_evidence(&mut completed, plan);

        let message = format!(
            "Pull request #{} opened: {}",
            completed.pr_number.unwrap_or_default(),
            completed.pr_url.as_deref().unwrap_or_default()
        );
        self.record_best_effort(completed.id, LogPhase::Complete, LogLevel::Info, &message, None);
        ExecutionResult::from_run(&completed)
    }

    /// Single best-effort bulk transition after completion. A failure here
    /// is repaired by [`ExecutionController::reconcile_work_orders`].
    fn update_work_orders(&self, run: &ExecutionRun) {
        if run.simulated {
            self.record_best_effort(
                run.id,
                LogPhase::WorkOrders,
                LogLevel::Info,
                "Simulation mode: work order status unchanged",
                None,
            );
            return;
        }
        match self.work_orders.mark_in_progress(&run.work_order_ids) {
            Ok(count) => self.record_best_effort(
                run.id,
                LogPhase::WorkOrders,
                LogLevel::Info,
                &format!(
                    "Marked {} of {} work order(s) IN_PROGRESS",
                    count,
                    run.work_order_ids.len()
                ),
                None,
            ),
            Err(err) => self.record_best_effort(
                run.id,
                LogPhase::WorkOrders,
                LogLevel::Warn,
                &format!("Work order status update failed: {}", err),
                None,
            ),
        }
    }

    fn write_evidence(&self, run: &mut ExecutionRun, plan: &RunPlan) {
        let Some(writer) = &self.evidence else {
            self.record_best_effort(
                run.id,
                LogPhase::Evidence,
                LogLevel::Info,
                "No evidence directory configured; bundle skipped",
                None,
            );
            return;
        };

        match self.bundle(writer, run, plan) {
            Ok(path) => {
                run.evidence_path = Some(path.clone());
                if let Err(err) = self.runs.update_run(run) {
                    tracing::warn!(run_id = %run.id, "Failed to record evidence path: {}", err);
                }
                self.record_best_effort(
                    run.id,
                    LogPhase::Evidence,
                    LogLevel::Info,
                    "Evidence bundle written",
                    Some(json!({ "evidence_path": path.to_string_lossy() })),
                );
            }
            Err(err) => self.record_best_effort(
                run.id,
                LogPhase::Evidence,
                LogLevel::Warn,
                &format!("Evidence bundle not written: {:#}", err),
                None,
            ),
        }
    }

    fn bundle(
        &self,
        writer: &EvidenceWriter,
        run: &ExecutionRun,
        plan: &RunPlan,
    ) -> anyhow::Result<PathBuf> {
        let logs = self
            .runs
            .list_logs(run.id)
            .context("Failed to read run log")?;
        let orders = self
            .orders_for(&run.work_order_ids)
            .unwrap_or_else(|_| plan.work_orders.clone());
        let path = writer.write(run, &logs, &orders)?;
        Ok(path)
    }

    fn finish_failure(&self, mut run: ExecutionRun, err: ExecutionError) -> ExecutionResult {
        let kind = err.kind();
        let message = Redacted::display(&err);
        match run.fail(kind, message.clone(), Utc::now()) {
            Ok(()) => {
                if let Err(store_err) = self.runs.update_run(&run) {
                    tracing::error!(run_id = %run.id, "Failed to persist run failure: {}", store_err);
                }
            }
            Err(state_err) => {
                tracing::error!(run_id = %run.id, "Cannot mark run failed: {}", state_err);
            }
        }
        self.record_best_effort(
            run.id,
            LogPhase::Error,
            LogLevel::Error,
            message.as_str(),
            Some(json!({ "error_kind": kind })),
        );
        ExecutionResult::from_run(&run)
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    fn info(&self, run_id: Uuid, phase: LogPhase, message: &str) -> Result<(), StoreError> {
        self.record(run_id, phase, LogLevel::Info, message, None)
    }

    /// Redact and append one entry, mirroring it to the operator log.
    fn record(
        &self,
        run_id: Uuid,
        phase: LogPhase,
        level: LogLevel,
        message: &str,
        detail: Option<Value>,
    ) -> Result<(), StoreError> {
        let entry = NewLogEntry {
            run_id,
            phase,
            level,
            message: Redacted::text(message),
            detail: detail.as_ref().map(Redacted::value),
        };
        trace_entry(&entry);
        self.runs.append_log(entry)?;
        Ok(())
    }

    /// For entries written after the outcome is decided.
    fn record_best_effort(
        &self,
        run_id: Uuid,
        phase: LogPhase,
        level: LogLevel,
        message: &str,
        detail: Option<Value>,
    ) {
        if let Err(err) = self.record(run_id, phase, level, message, detail) {
            tracing::error!(run_id = %run_id, phase = %phase, "Failed to append run log: {}", err);
        }
    }
}

fn trace_entry(entry: &NewLogEntry) {
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Info => tracing::info!(run_id = %entry.run_id, phase = %entry.phase, "{}", message),
        LogLevel::Warn => tracing::warn!(run_id = %entry.run_id, phase = %entry.phase, "{}", message),
        LogLevel::Error => tracing::error!(run_id = %entry.run_id, phase = %entry.phase, "{}", message),
    }
}

fn gate_decision_matches(
    project_id: &str,
    decision: Option<GateDecision>,
    expected_ref: Option<&str>,
) -> Result<GateDecision, ExecutionError> {
    let Some(decision) = decision else {
        return Err(ExecutionError::GateBlocked {
            project_id: project_id.to_string(),
            detail: "no council gate decision is recorded".to_string(),
        });
    };
    match expected_ref {
        Some(expected) if expected != decision.id => Err(ExecutionError::GateBlocked {
            project_id: project_id.to_string(),
            detail: format!(
                "gate decision {} does not match the recorded decision {}",
                expected, decision.id
            ),
        }),
        _ => Ok(decision),
    }
}

fn validate_request(request: &ExecutionRequest) -> Result<ValidRequest, ExecutionError> {
    let owner = required(&request.target_owner, "target_owner")?;
    if !is_valid_repo_segment(&owner) {
        return Err(ExecutionError::InvalidField {
            field: "target_owner",
            reason: SEGMENT_RULE.to_string(),
        });
    }
    let repo = required(&request.target_repo, "target_repo")?;
    if !is_valid_repo_segment(&repo) {
        return Err(ExecutionError::InvalidField {
            field: "target_repo",
            reason: SEGMENT_RULE.to_string(),
        });
    }
    let actor_id = required(&request.actor_id, "actor_id")?;

    let target_branch = request.target_branch_or_default().to_string();
    if !git2::Reference::is_valid_name(&format!("refs/heads/{}", target_branch)) {
        return Err(ExecutionError::InvalidField {
            field: "target_branch",
            reason: format!("'{}' is not a valid branch name", target_branch),
        });
    }

    let mut seen = HashSet::new();
    let work_order_ids: Vec<String> = request
        .work_order_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect();
    if work_order_ids.is_empty() {
        return Err(ExecutionError::NoWorkOrders);
    }

    Ok(ValidRequest {
        owner,
        repo,
        target_branch,
        actor_id,
        project_id: optional(request.project_id.as_deref()),
        gate_decision_ref: optional(request.gate_decision_ref.as_deref()),
        work_order_ids,
    })
}

fn required(value: &str, field: &'static str) -> Result<String, ExecutionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ExecutionError::MissingField { field });
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
