//! Workflow orchestrator: the control loops that drive workflows
//! from submission to a terminal status.
//!
//! The `Engine` owns the store handle and one cooperative runner task
//! per active workflow. All cross-replica coordination happens through
//! the store: `StepScheduled` appended under CAS is the claim that
//! makes an attempt at-most-once; replicas that lose the CAS simply
//! re-project and re-evaluate. There is no in-memory authority — a
//! runner can be killed at any point and recovery rebuilds everything
//! from the log.

use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{EngineError, StoreError};
use crate::events::{EventKind, EventRecord};
use crate::executor::{declared_outputs, retry_backoff, should_retry, StepExecutor, StepOutcome};
use crate::hibernate::BlobArchive;
use crate::plan::{
    evaluate_termination, frontier, plan_hash, step_arguments, validate, Termination,
};
use crate::projection::{apply, project};
use crate::script::ScriptEngine;
use crate::store::{EventFilter, EventStore, EventSubscription};
use crate::types::{
    ExecutionPlan, Sequence, Step, StepId, StepInvocationResponse, StepStatus, StepTransport,
    SubmitWorkflowRequest, SubmitWorkflowResponse, SubmittedPlan, WorkflowId, WorkflowState,
    WorkflowSummary,
};

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Result of fetching a workflow by id.
#[derive(Debug)]
pub enum WorkflowFetch {
    Found(Box<WorkflowState>),
    /// Aggregate is gone from the store but present in the archive.
    Hibernated,
    NotFound,
}

/// Result of ingesting an async-http callback.
#[derive(Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Accepted,
    /// Well-formed but no longer relevant (stale attempt, terminal
    /// workflow); acknowledged and dropped.
    Stale(String),
    NotFound,
    Forbidden,
}

/// Result of a cancellation request.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
    NotFound,
}

/// The engine: store handle, step catalog, executor, and one runner
/// task per active workflow.
pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn EventStore>,
    archive: Arc<dyn BlobArchive>,
    scripts: Arc<dyn ScriptEngine>,
    executor: StepExecutor,
    registry: RwLock<IndexMap<StepId, Step>>,
    runners: Mutex<HashMap<WorkflowId, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn EventStore>,
        archive: Arc<dyn BlobArchive>,
        scripts: Arc<dyn ScriptEngine>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let executor = StepExecutor::new(http, scripts.clone(), config.public_url.clone());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            store,
            archive,
            scripts,
            executor,
            registry: RwLock::new(IndexMap::new()),
            runners: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Live event feed with the given filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.store.subscribe(filter)
    }

    pub fn active_runner_count(&self) -> usize {
        self.runners.lock().expect("runner registry poisoned").len()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Step catalog
    // ───────────────────────────────────────────────────────────────────────

    /// Register a reusable step definition. Later registrations for
    /// the same id replace earlier ones.
    pub async fn register_step(&self, step: Step) -> Result<(), EngineError> {
        if step.id.is_empty() {
            return Err(EngineError::Validation("step id must not be empty".into()));
        }
        self.registry.write().await.insert(step.id.clone(), step);
        Ok(())
    }

    pub async fn registered_steps(&self) -> Vec<Step> {
        self.registry.read().await.values().cloned().collect()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Workflow lifecycle
    // ───────────────────────────────────────────────────────────────────────

    /// Submit a plan: resolve catalog references, validate, append
    /// `WorkflowStarted`, and start the runner. A duplicate workflow
    /// id surfaces as a sequence conflict.
    pub async fn submit(
        self: &Arc<Self>,
        request: SubmitWorkflowRequest,
    ) -> Result<SubmitWorkflowResponse, EngineError> {
        if request.workflow_id.is_empty() {
            return Err(EngineError::Validation("workflow_id must not be empty".into()));
        }

        let plan = self.resolve_plan(request.plan).await?;
        validate(&plan)?;

        for name in &plan.required {
            if !request.args.contains_key(name) {
                return Err(EngineError::Validation(format!(
                    "required input {name} was not supplied"
                )));
            }
        }
        for name in request.args.keys() {
            if !plan.required.contains(name) {
                return Err(EngineError::Validation(format!(
                    "argument {name} is not a declared required input"
                )));
            }
        }

        if self.archive.contains(&request.workflow_id).await? {
            // The id lives on in the archive; treat like a duplicate.
            return Err(EngineError::Store(StoreError::Conflict {
                expected: 0,
                actual: 1,
            }));
        }

        let hash = plan_hash(&plan);
        self.store
            .append(
                &request.workflow_id,
                0,
                EventKind::WorkflowStarted {
                    plan,
                    plan_hash: hash.clone(),
                    args: request.args,
                    metadata: request.metadata,
                },
            )
            .await?;

        info!(workflow_id = %request.workflow_id, plan_hash = %hash, "workflow started");
        self.spawn_runner(&request.workflow_id);

        Ok(SubmitWorkflowResponse {
            workflow_id: request.workflow_id,
            plan_hash: hash,
        })
    }

    /// Latest projected state of one workflow.
    pub async fn fetch(&self, workflow_id: &str) -> Result<WorkflowFetch, EngineError> {
        let events = self.store.read(workflow_id, 1).await?;
        if events.is_empty() {
            if self.archive.contains(workflow_id).await? {
                return Ok(WorkflowFetch::Hibernated);
            }
            return Ok(WorkflowFetch::NotFound);
        }
        Ok(WorkflowFetch::Found(Box::new(project(&events)?)))
    }

    /// Event slice of one workflow from a sequence.
    pub async fn events(
        &self,
        workflow_id: &str,
        from: Sequence,
    ) -> Result<Vec<EventRecord>, EngineError> {
        Ok(self.store.read(workflow_id, from).await?)
    }

    /// Summaries of every workflow currently in the store.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        let mut out = Vec::new();
        for id in self.store.index().await? {
            let events = self.store.read(&id, 1).await?;
            if events.is_empty() {
                continue;
            }
            match project(&events) {
                Ok(state) => out.push(WorkflowSummary {
                    workflow_id: state.id,
                    status: state.status,
                    version: state.version,
                }),
                Err(e) => warn!(workflow_id = %id, "unprojectable workflow skipped: {e}"),
            }
        }
        Ok(out)
    }

    /// Cancel a workflow by appending a terminal failure. Running
    /// executors observe cancellation through their runner.
    pub async fn cancel(&self, workflow_id: &str) -> Result<CancelOutcome, EngineError> {
        loop {
            let events = self.store.read(workflow_id, 1).await?;
            if events.is_empty() {
                return Ok(CancelOutcome::NotFound);
            }
            let state = project(&events)?;
            if state.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            let appended = self
                .store
                .append(
                    workflow_id,
                    state.version,
                    EventKind::WorkflowFailed {
                        at: Utc::now(),
                        error: "cancelled".into(),
                    },
                )
                .await;
            match appended {
                Ok(_) => {
                    info!(workflow_id, "workflow cancelled");
                    return Ok(CancelOutcome::Accepted);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Translate an async-http callback into the step's terminal
    /// event. The token path segment carries `<token>.<attempt>`; a
    /// stale attempt is acknowledged and dropped.
    pub async fn ingest_callback(
        &self,
        workflow_id: &str,
        step_id: &str,
        token_param: &str,
        body: StepInvocationResponse,
    ) -> Result<CallbackOutcome, EngineError> {
        loop {
            let events = self.store.read(workflow_id, 1).await?;
            if events.is_empty() {
                return Ok(CallbackOutcome::NotFound);
            }
            let state = project(&events)?;

            let Some(step) = state.plan.steps.get(step_id) else {
                return Ok(CallbackOutcome::NotFound);
            };
            let StepTransport::AsyncHttp { async_http } = &step.transport else {
                return Ok(CallbackOutcome::NotFound);
            };
            let Some((token, attempt_raw)) = token_param.rsplit_once('.') else {
                return Ok(CallbackOutcome::Forbidden);
            };
            if token != async_http.callback_token {
                return Ok(CallbackOutcome::Forbidden);
            }
            let Ok(attempt) = attempt_raw.parse::<u32>() else {
                return Ok(CallbackOutcome::Forbidden);
            };

            if state.status.is_terminal() {
                return Ok(CallbackOutcome::Stale("workflow already terminal".into()));
            }
            let exec = state.execution(step_id);
            let current = exec.map(|e| e.attempts).unwrap_or(0);
            let running = exec.map(|e| e.status == StepStatus::Running).unwrap_or(false);
            if !running || current != attempt {
                return Ok(CallbackOutcome::Stale(format!(
                    "attempt {attempt} is not the running attempt (current {current})"
                )));
            }

            let at = Utc::now();
            let kind = if body.success {
                EventKind::StepCompleted {
                    step_id: step_id.to_string(),
                    attempt,
                    outputs: declared_outputs(step, body.outputs.clone().unwrap_or_default()),
                    at,
                }
            } else {
                EventKind::StepFailed {
                    step_id: step_id.to_string(),
                    attempt,
                    error: body
                        .error
                        .clone()
                        .unwrap_or_else(|| "step reported failure".into()),
                    will_retry: false,
                    at,
                }
            };

            match self.store.append(workflow_id, state.version, kind).await {
                Ok(_) => {
                    info!(workflow_id, step_id, attempt, "async callback ingested");
                    return Ok(CallbackOutcome::Accepted);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Restore a hibernated workflow into the store. Returns false
    /// when nothing is archived under that id.
    pub async fn rehydrate(self: &Arc<Self>, workflow_id: &str) -> Result<bool, EngineError> {
        let Some(events) = self.archive.restore(workflow_id).await? else {
            return Ok(false);
        };
        let terminal = events
            .last()
            .map(|r| r.kind.is_terminal())
            .unwrap_or(true);
        if let Err(e) = self.store.restore_aggregate(workflow_id, events.clone()).await {
            // Put the archive entry back so the workflow is not lost.
            self.archive.archive(workflow_id, events).await?;
            return Err(e.into());
        }
        info!(workflow_id, "workflow rehydrated");
        if !terminal {
            self.spawn_runner(workflow_id);
        }
        Ok(true)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Background maintenance
    // ───────────────────────────────────────────────────────────────────────

    /// Restart recovery: resume a runner for every non-terminal
    /// workflow in the index. Returns how many were resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for id in self.store.index().await? {
            let tail = self.store.tail(&id).await?;
            if tail == 0 {
                continue;
            }
            let last = self.store.read(&id, tail).await?;
            let terminal = last.last().map(|r| r.kind.is_terminal()).unwrap_or(false);
            if !terminal && self.spawn_runner(&id) {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Move terminal workflows older than the threshold into the
    /// archive. Returns how many were hibernated.
    pub async fn sweep_hibernation(&self) -> Result<usize, EngineError> {
        let threshold = chrono::Duration::from_std(self.config.hibernate_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - threshold;
        let mut moved = 0;

        for id in self.store.index().await? {
            let tail = self.store.tail(&id).await?;
            if tail == 0 {
                continue;
            }
            let last = self.store.read(&id, tail).await?;
            let Some(record) = last.last() else { continue };
            if !record.kind.is_terminal() || record.timestamp > cutoff {
                continue;
            }

            let events = self.store.read(&id, 1).await?;
            self.archive.archive(&id, events).await?;
            self.store.delete_aggregate(&id).await?;
            info!(workflow_id = %id, "workflow hibernated");
            moved += 1;
        }
        Ok(moved)
    }

    /// Stop every runner, propagating cancellation to executors, and
    /// wait up to the configured grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<(WorkflowId, JoinHandle<()>)> = {
            let mut runners = self.runners.lock().expect("runner registry poisoned");
            runners.drain().collect()
        };

        let deadline = Instant::now() + self.config.shutdown_grace;
        for (id, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(workflow_id = %id, "runner did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────────

    async fn resolve_plan(&self, submitted: SubmittedPlan) -> Result<ExecutionPlan, EngineError> {
        let registry = self.registry.read().await;
        let mut steps = IndexMap::new();
        for (id, entry) in submitted.steps {
            let step = match entry {
                Some(step) => step,
                None => registry.get(&id).cloned().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "plan references unregistered step {id}"
                    ))
                })?,
            };
            steps.insert(id, step);
        }
        Ok(ExecutionPlan {
            goals: submitted.goals,
            required: submitted.required,
            steps,
        })
    }

    /// Start a runner for the workflow unless one is already live.
    fn spawn_runner(self: &Arc<Self>, workflow_id: &str) -> bool {
        let mut runners = self.runners.lock().expect("runner registry poisoned");
        if runners.contains_key(workflow_id) {
            return false;
        }
        let runner = Runner::new(self.clone(), workflow_id.to_string());
        runners.insert(workflow_id.to_string(), tokio::spawn(runner.run()));
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-workflow runner
// ═══════════════════════════════════════════════════════════════════════════

/// Executor result delivered back to the runner's inbox.
struct Completion {
    step_id: StepId,
    attempt: u32,
    result: Result<StepOutcome, EngineError>,
}

/// What woke the control loop.
enum Wakeup {
    Event,
    SubscriptionClosed,
    Done(Completion),
    Timer,
    Shutdown,
}

/// Cooperative control loop for one workflow: project, schedule the
/// frontier under CAS, launch executions, and suspend until an event,
/// a completion, or a timer needs attention.
struct Runner {
    engine: Arc<Engine>,
    workflow_id: WorkflowId,
    state: Option<WorkflowState>,
    /// Attempts currently driven by a local executor task.
    inflight: HashMap<StepId, u32>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    exec_cancel: watch::Sender<bool>,
    /// Stabilization anchor for a prospective failure/deadlock
    /// verdict: (version it was computed at, when it was first seen).
    pending_verdict: Option<(Sequence, Instant)>,
}

impl Runner {
    fn new(engine: Arc<Engine>, workflow_id: WorkflowId) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(32);
        let (exec_cancel, _) = watch::channel(false);
        Self {
            engine,
            workflow_id,
            state: None,
            inflight: HashMap::new(),
            completion_tx,
            completion_rx,
            exec_cancel,
            pending_verdict: None,
        }
    }

    async fn run(mut self) {
        let mut shutdown = self.engine.shutdown.subscribe();
        let mut subscription: Option<EventSubscription> = Some(
            self.engine
                .store
                .subscribe(EventFilter::for_workflow(&self.workflow_id)),
        );
        info!(workflow_id = %self.workflow_id, "workflow runner started");

        'control: loop {
            // 1. Catch up with the log.
            if let Err(e) = self.refresh().await {
                match e {
                    EngineError::Store(StoreError::Backend(msg)) => {
                        // Store trouble pauses the workflow, it does
                        // not fail it.
                        error!(workflow_id = %self.workflow_id, "store unreachable, pausing: {msg}");
                        tokio::select! {
                            _ = tokio::time::sleep(self.engine.config.store_poll_interval * 4) => continue 'control,
                            _ = shutdown.changed() => break 'control,
                        }
                    }
                    e => {
                        error!(workflow_id = %self.workflow_id, "projection failed: {e}");
                        self.fail_workflow(e.to_string()).await;
                        break 'control;
                    }
                }
            }

            let Some(state) = self.state.clone() else {
                // First event not visible yet; wait for it.
                match self.wait(&mut subscription, &mut shutdown, None).await {
                    Wakeup::Shutdown => break 'control,
                    Wakeup::Done(c) => self.handle_completion(c).await,
                    _ => {}
                }
                continue 'control;
            };

            // 2. Terminal?
            if state.status.is_terminal() {
                let _ = self.exec_cancel.send(true);
                info!(
                    workflow_id = %self.workflow_id,
                    status = %state.status,
                    "workflow reached terminal status"
                );
                break 'control;
            }

            // 3. Resolve the frontier and act on it.
            let front = frontier(&state.plan, &state, self.engine.scripts.as_ref());
            let mut appended = false;
            let mut lost_cas = false;

            for (step_id, reason) in &front.skips {
                match self
                    .append_applied(EventKind::StepSkipped {
                        step_id: step_id.clone(),
                        reason: reason.clone(),
                    })
                    .await
                {
                    Ok(true) => {
                        info!(workflow_id = %self.workflow_id, step_id = %step_id, "step skipped: {reason}");
                        appended = true;
                    }
                    Ok(false) => {
                        lost_cas = true;
                        break;
                    }
                    Err(e) => {
                        warn!(workflow_id = %self.workflow_id, "skip append failed: {e}");
                        lost_cas = true;
                        break;
                    }
                }
            }
            if lost_cas {
                continue 'control;
            }

            let now = Utc::now();
            let mut next_deadline: Option<Instant> = None;

            for step_id in &front.runnable {
                if self.inflight.contains_key(step_id) {
                    continue;
                }
                // Retry backoff gate: deterministic deadline from the
                // last failure event, identical on every replica.
                let exec = self
                    .state
                    .as_ref()
                    .and_then(|s| s.execution(step_id))
                    .cloned();
                if let Some(exec) = &exec {
                    if exec.attempts > 0 {
                        if let Some(failed_at) = exec.ended_at {
                            let step = &state.plan.steps[step_id];
                            let backoff = retry_backoff(&step.retry, exec.attempts);
                            let ready_at = failed_at
                                + chrono::Duration::from_std(backoff)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            if now < ready_at {
                                let wait = (ready_at - now)
                                    .to_std()
                                    .unwrap_or(Duration::from_millis(1));
                                push_deadline(&mut next_deadline, Instant::now() + wait);
                                continue;
                            }
                        }
                    }
                }

                match self.claim_and_launch(step_id).await {
                    Ok(true) => appended = true,
                    Ok(false) => {
                        lost_cas = true;
                        break;
                    }
                    Err(e) => {
                        warn!(workflow_id = %self.workflow_id, step_id = %step_id, "claim failed: {e}");
                        lost_cas = true;
                        break;
                    }
                }
            }
            if lost_cas || appended {
                continue 'control;
            }

            // 4. Lease recovery for attempts owned by a replica that
            // went away (including our own previous incarnation).
            if self.check_leases(&mut next_deadline).await {
                continue 'control;
            }

            // 5. Termination evaluation.
            let state = self.state.clone().expect("state present past refresh");
            let gated_retry = !front.runnable.is_empty();
            if !gated_retry && self.inflight.is_empty() {
                match evaluate_termination(&state, front.is_empty()) {
                    Termination::Completed(outputs) => {
                        // Goal completion is monotone; emit right away.
                        let _ = self
                            .append_applied(EventKind::WorkflowCompleted {
                                at: Utc::now(),
                                outputs,
                            })
                            .await;
                        continue 'control;
                    }
                    verdict @ (Termination::Failed(_) | Termination::Deadlocked(_)) => {
                        // Failure verdicts must survive a stabilization
                        // interval with no appends from any replica.
                        if self.verdict_stable(&state, &mut next_deadline) {
                            let error = match verdict {
                                Termination::Deadlocked(detail) => {
                                    // An unsatisfiable plan slipped
                                    // past submission.
                                    let e = EngineError::Deadlock(detail);
                                    error!(workflow_id = %self.workflow_id, "{e}");
                                    e.to_string()
                                }
                                Termination::Failed(error) => error,
                                _ => unreachable!(),
                            };
                            let _ = self
                                .append_applied(EventKind::WorkflowFailed {
                                    at: Utc::now(),
                                    error,
                                })
                                .await;
                            continue 'control;
                        }
                    }
                    Termination::Pending => {
                        self.pending_verdict = None;
                    }
                }
            } else {
                self.pending_verdict = None;
            }

            // 6. Suspend until something happens.
            match self.wait(&mut subscription, &mut shutdown, next_deadline).await {
                Wakeup::Shutdown => {
                    let _ = self.exec_cancel.send(true);
                    break 'control;
                }
                Wakeup::Done(c) => self.handle_completion(c).await,
                Wakeup::SubscriptionClosed => {
                    warn!(workflow_id = %self.workflow_id, "subscription closed, falling back to polling");
                    subscription = None;
                }
                Wakeup::Event | Wakeup::Timer => {}
            }
        }

        self.engine
            .runners
            .lock()
            .expect("runner registry poisoned")
            .remove(&self.workflow_id);
        info!(workflow_id = %self.workflow_id, "workflow runner stopped");
    }

    /// Read and fold any events past our cached version.
    async fn refresh(&mut self) -> Result<(), EngineError> {
        match self.state.take() {
            None => {
                let events = self.engine.store.read(&self.workflow_id, 1).await?;
                if !events.is_empty() {
                    self.state = Some(project(&events)?);
                }
                Ok(())
            }
            Some(mut state) => {
                let records = self
                    .engine
                    .store
                    .read(&self.workflow_id, state.version + 1)
                    .await?;
                for record in &records {
                    state = apply(state, record)?;
                }
                self.state = Some(state);
                Ok(())
            }
        }
    }

    /// Append at the cached version and fold the new record into the
    /// cached state. `Ok(false)` means the CAS was lost.
    async fn append_applied(&mut self, kind: EventKind) -> Result<bool, EngineError> {
        let version = self.state.as_ref().map(|s| s.version).unwrap_or(0);
        match self
            .engine
            .store
            .append(&self.workflow_id, version, kind)
            .await
        {
            Ok(record) => {
                if let Some(state) = self.state.take() {
                    self.state = Some(apply(state, &record)?);
                }
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim one frontier step via CAS and launch its executor task.
    /// `Ok(false)` means another replica won the claim (or the log
    /// moved); the caller re-projects.
    async fn claim_and_launch(&mut self, step_id: &str) -> Result<bool, EngineError> {
        let state = self.state.as_ref().expect("claim without state");
        let attempt = state
            .execution(step_id)
            .map(|e| e.attempts + 1)
            .unwrap_or(1);

        if !self
            .append_applied(EventKind::StepScheduled {
                step_id: step_id.to_string(),
                attempt,
            })
            .await?
        {
            debug!(workflow_id = %self.workflow_id, step_id, "lost scheduling race");
            return Ok(false);
        }
        info!(workflow_id = %self.workflow_id, step_id, attempt, "step claimed");

        // The claim is ours; persist StepStarted even if unrelated
        // events (callbacks, cancellation) interleave.
        loop {
            if self
                .append_applied(EventKind::StepStarted {
                    step_id: step_id.to_string(),
                    attempt,
                    at: Utc::now(),
                })
                .await?
            {
                break;
            }
            self.refresh().await?;
            let state = self.state.as_ref().expect("state after refresh");
            if state.status.is_terminal() {
                return Ok(true);
            }
            let still_ours = state
                .execution(step_id)
                .map(|e| e.attempts == attempt && e.status == StepStatus::Pending && e.scheduled)
                .unwrap_or(false);
            if !still_ours {
                return Ok(false);
            }
        }

        let state = self.state.as_ref().expect("state after start");
        let step = state.plan.steps[step_id].clone();
        let arguments = step_arguments(&step, &state.args).unwrap_or_default();
        let metadata = state.metadata.clone();
        let workflow_id = self.workflow_id.clone();
        let executor = self.engine.executor.clone();
        let cancel = self.exec_cancel.subscribe();
        let tx = self.completion_tx.clone();

        self.inflight.insert(step_id.to_string(), attempt);
        tokio::spawn(async move {
            let result = executor
                .execute(&step, &workflow_id, attempt, arguments, metadata, cancel)
                .await;
            let _ = tx
                .send(Completion {
                    step_id: step.id.clone(),
                    attempt,
                    result,
                })
                .await;
        });
        Ok(true)
    }

    /// Translate an executor completion into the attempt's terminal
    /// event.
    async fn handle_completion(&mut self, completion: Completion) {
        self.inflight.remove(&completion.step_id);
        let step_id = completion.step_id.clone();
        let attempt = completion.attempt;

        match completion.result {
            Ok(StepOutcome::Completed(outputs)) => {
                info!(workflow_id = %self.workflow_id, step_id, attempt, "step completed");
                self.append_outcome(
                    &step_id,
                    attempt,
                    EventKind::StepCompleted {
                        step_id: step_id.clone(),
                        attempt,
                        outputs,
                        at: Utc::now(),
                    },
                )
                .await;
            }
            Ok(StepOutcome::AwaitingCallback) => {
                // The step stays running; the callback path or the
                // lease timeout resolves it.
                debug!(workflow_id = %self.workflow_id, step_id, attempt, "async step dispatched");
            }
            Err(EngineError::Cancelled) => {
                debug!(workflow_id = %self.workflow_id, step_id, attempt, "execution cancelled");
            }
            Err(e) => {
                let state = self.state.as_ref();
                let policy = state
                    .and_then(|s| s.plan.steps.get(&step_id))
                    .map(|s| s.retry.clone())
                    .unwrap_or_default();
                let will_retry = should_retry(&policy, attempt, &e);
                error!(
                    workflow_id = %self.workflow_id,
                    step_id,
                    attempt,
                    will_retry,
                    "step failed: {e}"
                );
                self.append_outcome(
                    &step_id,
                    attempt,
                    EventKind::StepFailed {
                        step_id: step_id.clone(),
                        attempt,
                        error: e.to_string(),
                        will_retry,
                        at: Utc::now(),
                    },
                )
                .await;
            }
        }
    }

    /// Append an attempt outcome with a fresh sequence, dropping it if
    /// the log shows the attempt was superseded meanwhile.
    async fn append_outcome(&mut self, step_id: &str, attempt: u32, kind: EventKind) {
        loop {
            if let Err(e) = self.refresh().await {
                error!(workflow_id = %self.workflow_id, "cannot refresh before outcome append: {e}");
                return;
            }
            let Some(state) = self.state.as_ref() else { return };
            if state.status.is_terminal() {
                debug!(workflow_id = %self.workflow_id, step_id, "dropping outcome for terminal workflow");
                return;
            }
            let still_current = state
                .execution(step_id)
                .map(|e| e.attempts == attempt && e.status == StepStatus::Running)
                .unwrap_or(false);
            if !still_current {
                warn!(workflow_id = %self.workflow_id, step_id, attempt, "attempt superseded, dropping outcome");
                return;
            }
            match self.append_applied(kind.clone()).await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    error!(workflow_id = %self.workflow_id, "outcome append failed: {e}");
                    return;
                }
            }
        }
    }

    /// Re-claim attempts whose owner stopped reporting: a running (or
    /// claimed-but-never-started) step past the lease timeout goes
    /// through a fresh scheduling CAS at `attempts + 1` and is driven
    /// by this replica, or fails terminally when its retry budget is
    /// spent. Returns true when the log changed (or the CAS was lost)
    /// and the loop must re-project.
    async fn check_leases(&mut self, next_deadline: &mut Option<Instant>) -> bool {
        let Some(state) = self.state.clone() else { return false };
        let lease = self.engine.config.lease_timeout;
        let now = Utc::now();

        for (step_id, exec) in &state.executions {
            if self.inflight.contains_key(step_id) {
                continue;
            }
            let anchor = match exec.status {
                StepStatus::Running => exec.started_at,
                StepStatus::Pending if exec.scheduled => exec.scheduled_at,
                _ => None,
            };
            let Some(anchor) = anchor else { continue };
            let expires = anchor
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());

            if now < expires {
                let wait = (expires - now).to_std().unwrap_or(Duration::from_millis(1));
                push_deadline(next_deadline, Instant::now() + wait);
                continue;
            }

            let step = &state.plan.steps[step_id];
            if exec.attempts < step.retry.max_attempts {
                warn!(
                    workflow_id = %self.workflow_id,
                    step_id = %step_id,
                    attempt = exec.attempts,
                    "lease expired, re-claiming"
                );
                if let Err(e) = self.claim_and_launch(step_id).await {
                    warn!(workflow_id = %self.workflow_id, "lease re-claim failed: {e}");
                }
            } else {
                let kind = EventKind::StepFailed {
                    step_id: step_id.clone(),
                    attempt: exec.attempts,
                    error: "lease expired with no retry budget left".into(),
                    will_retry: false,
                    at: now,
                };
                if let Err(e) = self.append_applied(kind).await {
                    warn!(workflow_id = %self.workflow_id, "lease append failed: {e}");
                }
            }
            return true;
        }
        false
    }

    /// True once a failure/deadlock verdict has held for a full
    /// stabilization interval with no new events from any replica.
    fn verdict_stable(&mut self, state: &WorkflowState, next_deadline: &mut Option<Instant>) -> bool {
        let stabilization = self.engine.config.stabilization;
        match self.pending_verdict {
            Some((version, since)) if version == state.version => {
                if since.elapsed() >= stabilization {
                    true
                } else {
                    push_deadline(next_deadline, since + stabilization);
                    false
                }
            }
            _ => {
                self.pending_verdict = Some((state.version, Instant::now()));
                push_deadline(next_deadline, Instant::now() + stabilization);
                false
            }
        }
    }

    /// Terminal failure emitted by the runner itself (projection
    /// breakage and similar unrecoverable conditions).
    async fn fail_workflow(&mut self, error: String) {
        loop {
            let tail = match self.engine.store.tail(&self.workflow_id).await {
                Ok(t) => t,
                Err(e) => {
                    error!(workflow_id = %self.workflow_id, "cannot fail workflow: {e}");
                    return;
                }
            };
            // Raw tail check: this path runs when projection itself is
            // broken, so never stack a second terminal event.
            match self.engine.store.read(&self.workflow_id, tail).await {
                Ok(last) if last.last().map(|r| r.kind.is_terminal()).unwrap_or(false) => return,
                Ok(_) => {}
                Err(e) => {
                    error!(workflow_id = %self.workflow_id, "cannot fail workflow: {e}");
                    return;
                }
            }
            let appended = self
                .engine
                .store
                .append(
                    &self.workflow_id,
                    tail,
                    EventKind::WorkflowFailed {
                        at: Utc::now(),
                        error: error.clone(),
                    },
                )
                .await;
            match appended {
                Ok(_) => return,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => {
                    error!(workflow_id = %self.workflow_id, "cannot fail workflow: {e}");
                    return;
                }
            }
        }
    }

    /// Suspend until an event, an executor completion, a timer, or
    /// shutdown. Never spins: with no deadline and no subscription the
    /// poll fallback provides the heartbeat.
    async fn wait(
        &mut self,
        subscription: &mut Option<EventSubscription>,
        shutdown: &mut watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Wakeup {
        let poll = self.engine.config.store_poll_interval;
        let wake_at = match (deadline, subscription.is_none()) {
            (Some(t), false) => Some(t),
            (Some(t), true) => Some(t.min(Instant::now() + poll)),
            (None, true) => Some(Instant::now() + poll),
            (None, false) => None,
        };

        tokio::select! {
            event = next_event(subscription) => match event {
                Some(_) => Wakeup::Event,
                None => Wakeup::SubscriptionClosed,
            },
            completion = self.completion_rx.recv() => match completion {
                Some(c) => Wakeup::Done(c),
                // All senders live in self; recv cannot fail while the
                // runner owns a tx clone. Treat defensively anyway.
                None => Wakeup::Timer,
            },
            _ = sleep_until_opt(wake_at) => Wakeup::Timer,
            _ = shutdown.changed() => Wakeup::Shutdown,
        }
    }
}

fn push_deadline(slot: &mut Option<Instant>, candidate: Instant) {
    match slot {
        Some(existing) if *existing <= candidate => {}
        _ => *slot = Some(candidate),
    }
}

async fn next_event(subscription: &mut Option<EventSubscription>) -> Option<EventRecord> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
