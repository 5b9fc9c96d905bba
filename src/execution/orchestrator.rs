//! Workflow orchestration.
//!
//! The `Orchestrator` drives a [`Workflow`] through a run: it validates the
//! graph, seeds completed tasks from the checkpoint store, dispatches ready
//! tasks up to the parallelism bound, applies `on_success` / `on_failure`
//! routes and settles the final run status.
//!
//! Task runners execute concurrently, but every scheduling decision and
//! every checkpoint write happens on the orchestrator's own loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::checkpoint::{
    CheckpointError, CheckpointStore, RunStatus, RunSummary, TaskResult, TaskStatus,
};
use crate::config::EngineConfig;
use crate::core::graph::{Graph, GraphError};
use crate::core::types::{RunId, TaskId};
use crate::core::workflow::Workflow;
use crate::events::{Event, EventBus};
use crate::session::SessionRegistry;

use super::runner::{TaskOutcome, TaskRunner};

/// Default bound on concurrently running tasks.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default interval between checks for a persisted cancellation request.
pub const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(250);

const MIN_CANCEL_POLL: Duration = Duration::from_millis(1);

/// Errors that stop a run from being driven.
///
/// Task failures are not errors: they end up in the [`RunReport`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("task '{0}' is not part of the workflow")]
    UnknownTask(TaskId),

    #[error("run '{run_id}' belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch {
        run_id: RunId,
        expected: String,
        found: String,
    },
}

/// How a run is started.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run id to use; generated when absent.
    pub run_id: Option<RunId>,
    /// Resolve every task to `dry_run` without dispatching.
    pub dry_run: bool,
    /// Discard any existing checkpoint for the run id.
    pub force: bool,
    /// Continue an existing run instead of starting a new one.
    pub resume: bool,
    /// Restrict the run to this task and its transitive dependencies.
    pub only_task: Option<TaskId>,
    /// On resume, re-run this task and everything reachable from it.
    pub from_task: Option<TaskId>,
}

impl RunOptions {
    /// Options for a fresh run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for resuming an existing run.
    pub fn resume(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            resume: true,
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_only_task(mut self, task: impl Into<TaskId>) -> Self {
        self.only_task = Some(task.into());
        self
    }

    pub fn with_from_task(mut self, task: impl Into<TaskId>) -> Self {
        self.from_task = Some(task.into());
        self
    }
}

/// Outcome of driving a run.
///
/// Task lists are in declaration order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Tasks that reached terminal-success in this invocation.
    pub completed: Vec<TaskId>,
    /// Tasks already complete from an earlier invocation.
    pub skipped: Vec<TaskId>,
    /// Tasks that failed for good, handled or not.
    pub failed: Vec<TaskId>,
    /// Failed tasks whose `on_failure` route took over.
    pub handled: Vec<TaskId>,
    /// Due tasks that were never dispatched.
    pub blocked: Vec<TaskId>,
    /// Route-gated tasks none of whose routes fired.
    pub not_triggered: Vec<TaskId>,
    pub duration: Duration,
}

impl RunReport {
    /// Whether the run ended `completed`.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    fn unchanged(run_id: RunId, status: RunStatus, skipped: Vec<TaskId>) -> Self {
        Self {
            run_id,
            status,
            completed: Vec::new(),
            skipped,
            failed: Vec::new(),
            handled: Vec::new(),
            blocked: Vec::new(),
            not_triggered: Vec::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Scheduling state of one run. Only the orchestrator loop touches it.
struct RunState {
    scope: HashSet<TaskId>,
    gated: HashSet<TaskId>,
    fired: HashSet<TaskId>,
    seeded: HashSet<TaskId>,
    completed: HashSet<TaskId>,
    dispatched: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    handled: HashSet<TaskId>,
}

impl RunState {
    fn new(graph: &Graph, scope: HashSet<TaskId>, seeded: HashSet<TaskId>) -> Self {
        let gated = scope
            .iter()
            .filter(|id| graph.is_route_gated(id))
            .cloned()
            .collect();

        let mut state = Self {
            scope,
            gated,
            fired: HashSet::new(),
            completed: seeded.clone(),
            seeded,
            dispatched: HashSet::new(),
            failed: HashSet::new(),
            handled: HashSet::new(),
        };

        // Routes out of tasks finished earlier still hold.
        let sources: Vec<TaskId> = state.seeded.iter().cloned().collect();
        for id in sources {
            if let Some(target) = graph.get_task(&id).and_then(|t| t.on_success.clone()) {
                state.fire(target);
            }
        }
        state
    }

    fn fire(&mut self, target: TaskId) {
        if self.scope.contains(&target) {
            self.fired.insert(target);
        }
    }

    /// Tasks that may be dispatched now, in declaration order.
    fn ready(&self, graph: &Graph) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = graph
            .ready_tasks(&self.completed)
            .into_iter()
            .filter(|id| {
                self.scope.contains(id) && !self.gated.contains(id) && !self.dispatched.contains(id)
            })
            .collect();

        ready.extend(
            self.fired
                .iter()
                .filter(|id| !self.completed.contains(*id) && !self.dispatched.contains(*id))
                .cloned(),
        );
        ready.sort_by_key(|id| graph.position(id));
        ready.dedup();
        ready
    }

    fn is_due(&self, id: &TaskId) -> bool {
        self.scope.contains(id)
            && (!self.gated.contains(id) || self.fired.contains(id) || self.completed.contains(id))
    }

    fn report(
        &self,
        graph: &Graph,
        run_id: RunId,
        status: RunStatus,
        duration: Duration,
    ) -> RunReport {
        let mut report = RunReport::unchanged(run_id, status, Vec::new());
        report.duration = duration;

        for task in graph.tasks() {
            let id = &task.id;
            if !self.scope.contains(id) {
                continue;
            }
            if self.seeded.contains(id) {
                report.skipped.push(id.clone());
            } else if self.completed.contains(id) {
                report.completed.push(id.clone());
            } else if self.failed.contains(id) {
                report.failed.push(id.clone());
                if self.handled.contains(id) {
                    report.handled.push(id.clone());
                }
            } else if self.is_due(id) {
                report.blocked.push(id.clone());
            } else {
                report.not_triggered.push(id.clone());
            }
        }
        report
    }

    fn summary(&self, report: &RunReport) -> RunSummary {
        let summary = RunSummary::new(
            report.completed.len() + report.skipped.len(),
            report.failed.len(),
        );

        let unhandled: Vec<&str> = report
            .failed
            .iter()
            .filter(|id| !self.handled.contains(*id))
            .map(TaskId::as_str)
            .collect();

        if !unhandled.is_empty() {
            summary.with_error(format!("tasks failed: {}", unhandled.join(", ")))
        } else if !report.blocked.is_empty() {
            let blocked: Vec<&str> = report.blocked.iter().map(TaskId::as_str).collect();
            summary.with_error(format!("deadlock: tasks never became ready: {}", blocked.join(", ")))
        } else {
            summary
        }
    }
}

/// Drives workflow runs.
pub struct Orchestrator {
    checkpoint: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    sessions: SessionRegistry,
    max_parallel: usize,
    cancel_poll: Duration,
    id_prefix: String,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with default sessions and limits.
    pub fn new(checkpoint: Arc<dyn CheckpointStore>, events: Arc<EventBus>) -> Self {
        Self {
            checkpoint,
            events,
            sessions: SessionRegistry::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancel_poll: DEFAULT_CANCEL_POLL,
            id_prefix: "wf".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Create an orchestrator with limits taken from the engine config.
    pub fn from_config(
        config: &EngineConfig,
        checkpoint: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self::new(checkpoint, events)
            .with_max_parallel(config.max_parallel)
            .with_cancel_poll_interval(config.cancel_poll_interval())
            .with_id_prefix(config.id_prefix.clone())
    }

    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    /// Bound on concurrently running tasks. Zero is treated as one.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// How often the store is checked for cancellation requests. Clamped to
    /// at least one millisecond.
    pub fn with_cancel_poll_interval(mut self, poll: Duration) -> Self {
        self.cancel_poll = poll.max(MIN_CANCEL_POLL);
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels every run driven by this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Persist a cancellation request for a run, possibly driven elsewhere.
    pub async fn request_cancel(&self, run_id: &RunId) -> Result<(), OrchestratorError> {
        self.checkpoint.request_cancel(run_id).await?;
        info!(run = %run_id, "cancellation requested");
        Ok(())
    }

    /// Resume a run from its checkpoint.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: &RunId,
        from_task: Option<TaskId>,
    ) -> Result<RunReport, OrchestratorError> {
        let options = RunOptions {
            from_task,
            ..RunOptions::resume(run_id.clone())
        };
        self.run(workflow, options).await
    }

    /// Drive a run to a terminal status.
    ///
    /// Configuration problems are returned as errors before the run is
    /// touched and before any event is emitted. Task failures are reported
    /// in the returned [`RunReport`].
    pub async fn run(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> Result<RunReport, OrchestratorError> {
        let run_id = self.check_options(workflow, &options)?;

        let span = info_span!("workflow_run", run = %run_id, workflow = workflow.name());
        async {
            if let Some(report) = self.prepare(workflow, &run_id, &options).await? {
                return Ok(report);
            }
            self.drive(workflow, &run_id, &options).await
        }
        .instrument(span)
        .await
    }

    /// Validate `workflow` and create its run record without dispatching
    /// anything.
    ///
    /// Fails with `DuplicateRun` if the run is already live. The claimed run
    /// is then driven with [`RunOptions::resume`].
    pub async fn init(
        &self,
        workflow: &Workflow,
        options: &RunOptions,
    ) -> Result<RunId, OrchestratorError> {
        let run_id = self.check_options(workflow, options)?;
        if options.force {
            self.checkpoint.delete_run(&run_id).await?;
        }
        self.checkpoint.init_run(&run_id, workflow.name()).await?;
        info!(run = %run_id, workflow = workflow.name(), "run initialized");
        Ok(run_id)
    }

    fn check_options(
        &self,
        workflow: &Workflow,
        options: &RunOptions,
    ) -> Result<RunId, OrchestratorError> {
        let graph = workflow.graph();
        workflow.validate()?;

        for id in options.only_task.iter().chain(options.from_task.iter()) {
            if !graph.contains(id) {
                return Err(OrchestratorError::UnknownTask(id.clone()));
            }
        }

        Ok(options
            .run_id
            .clone()
            .unwrap_or_else(|| RunId::generate(&self.id_prefix)))
    }

    /// Create or reopen the run record. Returns a report when there is
    /// nothing left to do.
    async fn prepare(
        &self,
        workflow: &Workflow,
        run_id: &RunId,
        options: &RunOptions,
    ) -> Result<Option<RunReport>, OrchestratorError> {
        if options.force {
            debug!("discarding existing checkpoint");
            self.checkpoint.delete_run(run_id).await?;
        }

        if !options.resume || options.force {
            self.checkpoint.init_run(run_id, workflow.name()).await?;
            return Ok(None);
        }

        let record = self.checkpoint.get_run(run_id).await?;
        if record.workflow_name != workflow.name() {
            return Err(OrchestratorError::WorkflowMismatch {
                run_id: run_id.clone(),
                expected: workflow.name().to_string(),
                found: record.workflow_name,
            });
        }

        if let Some(from) = &options.from_task {
            let invalidated = workflow.graph().reachable_from(from)?;
            info!(from = %from, count = invalidated.len(), "invalidating tasks for re-run");
            self.checkpoint.invalidate_tasks(run_id, &invalidated).await?;
        } else if record.status == RunStatus::Completed {
            info!("run already completed, nothing to resume");
            let completed = self.checkpoint.load_completed(run_id).await?;
            let skipped = workflow
                .graph()
                .task_ids()
                .into_iter()
                .filter(|id| completed.contains(id))
                .collect();
            return Ok(Some(RunReport::unchanged(
                run_id.clone(),
                RunStatus::Completed,
                skipped,
            )));
        }

        if record.status != RunStatus::Initialized {
            debug!(from = %record.status, "reopening run");
            self.checkpoint.reopen_run(run_id).await?;
        }
        Ok(None)
    }

    fn parallelism(&self, workflow: &Workflow) -> usize {
        workflow
            .max_parallel()
            .map_or(self.max_parallel, |n| n.min(self.max_parallel))
            .max(1)
    }

    async fn cancellation_requested(&self, run_id: &RunId) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.checkpoint.cancel_requested(run_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(error = %e, "failed to check for cancellation");
                false
            }
        }
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        run_id: &RunId,
        options: &RunOptions,
    ) -> Result<RunReport, OrchestratorError> {
        let graph = workflow.graph();
        let start = Instant::now();

        let scope: HashSet<TaskId> = match &options.only_task {
            Some(task) => graph.with_dependencies(task)?.into_iter().collect(),
            None => graph.task_ids().into_iter().collect(),
        };
        let seeded: HashSet<TaskId> = self
            .checkpoint
            .load_completed(run_id)
            .await?
            .into_iter()
            .filter(|id| scope.contains(id))
            .collect();
        let mut state = RunState::new(graph, scope, seeded);

        self.checkpoint
            .update_run_status(run_id, RunStatus::Running, RunSummary::default())
            .await?;
        info!(
            tasks = state.scope.len(),
            resumed = state.seeded.len(),
            dry_run = options.dry_run,
            "workflow started"
        );
        self.events
            .emit(Event::WorkflowStarted {
                run_id: run_id.clone(),
                workflow: workflow.name().to_string(),
                total_tasks: state.scope.len(),
                resumed_tasks: state.seeded.len(),
                timestamp: Utc::now(),
            })
            .await;

        let runner = Arc::new(TaskRunner::new(
            self.sessions.clone(),
            Arc::clone(&self.checkpoint),
            Arc::clone(&self.events),
        ));
        let limit = self.parallelism(workflow);
        let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut cancelled = false;

        let mut poll = interval(self.cancel_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !cancelled && self.cancellation_requested(run_id).await {
                info!(in_flight = in_flight.len(), "cancelled, no further tasks will start");
                cancelled = true;
            }

            if !cancelled {
                for id in state.ready(graph) {
                    if in_flight.len() >= limit {
                        break;
                    }
                    let Some(task) = graph.get_task(&id).cloned() else {
                        continue;
                    };

                    if let Err(e) = self
                        .checkpoint
                        .record_task_result(run_id, TaskResult::running(id.clone(), 1))
                        .await
                    {
                        warn!(task = %id, error = %e, "failed to record task start");
                    }
                    self.events
                        .emit(Event::TaskStarted {
                            run_id: run_id.clone(),
                            task_id: id.clone(),
                            attempt: 1,
                            session: task.session.to_string(),
                            timestamp: Utc::now(),
                        })
                        .await;

                    let span = info_span!("task", run = %run_id, task = %id);
                    let runner = Arc::clone(&runner);
                    let task_run_id = run_id.clone();
                    let dry_run = options.dry_run;
                    let handle = in_flight.spawn(
                        async move { runner.run(&task_run_id, &task, dry_run).await }
                            .instrument(span),
                    );

                    running.insert(handle.id(), id.clone());
                    state.dispatched.insert(id);
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next_with_id() => match joined {
                    Some(Ok((handle_id, outcome))) => {
                        if running.remove(&handle_id).is_some() {
                            self.settle(graph, run_id, &mut state, outcome).await;
                        }
                    }
                    Some(Err(e)) => {
                        if let Some(id) = running.remove(&e.id()) {
                            error!(task = %id, error = %e, "task runner aborted");
                            let outcome = TaskOutcome {
                                result: TaskResult::finished(id, TaskStatus::Failed, 1)
                                    .with_error(format!("task runner aborted: {}", e)),
                                error: None,
                            };
                            self.settle(graph, run_id, &mut state, outcome).await;
                        }
                    }
                    None => {}
                },
                _ = self.cancel.cancelled(), if !cancelled => {}
                _ = poll.tick(), if !cancelled => {}
            }
        }

        let duration = start.elapsed();
        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            let done = state.scope.iter().filter(|id| state.is_due(id)).all(|id| {
                state.completed.contains(id) || state.handled.contains(id)
            });
            if done {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            }
        };

        let report = state.report(graph, run_id.clone(), status, duration);
        let summary = state.summary(&report);
        if let Some(reason) = &summary.error {
            warn!(reason = %reason, "run did not complete cleanly");
        }
        self.checkpoint
            .update_run_status(run_id, status, summary.clone())
            .await?;

        info!(
            status = %status,
            completed = summary.tasks_completed,
            failed = summary.tasks_failed,
            duration_ms = duration.as_millis() as u64,
            "workflow finished"
        );

        let event = if status == RunStatus::Cancelled {
            Event::WorkflowCancelled {
                run_id: run_id.clone(),
                completed: summary.tasks_completed,
                failed: summary.tasks_failed,
                timestamp: Utc::now(),
            }
        } else {
            Event::WorkflowCompleted {
                run_id: run_id.clone(),
                status,
                completed: summary.tasks_completed,
                failed: summary.tasks_failed,
                duration,
                timestamp: Utc::now(),
            }
        };
        self.events.emit(event).await;

        Ok(report)
    }

    /// Record a finished task and apply its routes.
    async fn settle(
        &self,
        graph: &Graph,
        run_id: &RunId,
        state: &mut RunState,
        outcome: TaskOutcome,
    ) {
        let result = outcome.result;
        let id = result.task_id.clone();
        let task = graph.get_task(&id);

        // A result that was not persisted counts as not completed.
        if let Err(e) = self
            .checkpoint
            .record_task_result(run_id, result.clone())
            .await
        {
            error!(task = %id, error = %e, "failed to record task result");
            state.failed.insert(id.clone());
            self.events
                .emit(Event::TaskFailed {
                    run_id: run_id.clone(),
                    task_id: id,
                    attempt: result.attempt,
                    exit_code: result.exit_code,
                    error: format!("checkpoint write failed: {}", e),
                    timestamp: Utc::now(),
                })
                .await;
            return;
        }

        if result.is_terminal_success() {
            info!(task = %id, status = %result.status, attempt = result.attempt, "task complete");
            state.completed.insert(id.clone());
            if let Some(target) = task.and_then(|t| t.on_success.clone()) {
                debug!(task = %id, target = %target, "routing on success");
                state.fire(target);
            }
            self.events
                .emit(Event::TaskCompleted {
                    run_id: run_id.clone(),
                    task_id: id,
                    status: result.status,
                    attempt: result.attempt,
                    exit_code: result.exit_code,
                    duration: Duration::from_millis(result.duration_ms),
                    timestamp: Utc::now(),
                })
                .await;
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!(task = %id, attempt = result.attempt, error = %error, "task failed");
            state.failed.insert(id.clone());
            if let Some(target) = task.and_then(|t| t.on_failure.clone()) {
                debug!(task = %id, target = %target, "routing on failure");
                state.handled.insert(id.clone());
                state.fire(target);
            }
            self.events
                .emit(Event::TaskFailed {
                    run_id: run_id.clone(),
                    task_id: id,
                    attempt: result.attempt,
                    exit_code: result.exit_code,
                    error,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }
}
