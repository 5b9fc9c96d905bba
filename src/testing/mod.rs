//! Testing utilities for users of the dagflow library.
//!
//! This module provides helpers for testing workflows without running real
//! commands:
//!
//! - [`ScriptedSession`]: A session adapter with scripted per-task outcomes
//! - [`RecordingHandler`]: An event handler that keeps every event
//! - [`TestHarness`]: Runs workflows with in-memory checkpoint storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::core::types::TaskId;
use crate::core::workflow::Workflow;
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::{Orchestrator, OrchestratorError, RunOptions, RunReport};
use crate::session::{CommandOutput, Dispatch, Session, SessionError, SessionRegistry, SessionRequest};

/// Scripted behaviour for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Script {
    FailAlways { exit_code: i32 },
    FailTimes { remaining: u32, exit_code: i32 },
    Inject,
    Unavailable,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrements the in-flight counter when an attempt ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A session adapter whose outcomes are scripted per task.
///
/// Tasks without a script succeed with exit code 0. Every dispatch is
/// recorded, so tests can assert how often and in which order commands ran
/// and how many ran at once.
///
/// # Example
///
/// ```
/// use dagflow::testing::ScriptedSession;
///
/// let session = ScriptedSession::new()
///     .fail_times("flaky", 2, 1)
///     .fail_always("broken", 3);
/// assert_eq!(session.total_invocations(), 0);
/// ```
#[derive(Default)]
pub struct ScriptedSession {
    scripts: Mutex<HashMap<TaskId, Script>>,
    delays: HashMap<TaskId, Duration>,
    default_delay: Duration,
    invocations: Mutex<Vec<TaskId>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSession {
    /// Create a session where every task succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a task to always exit with `exit_code`.
    pub fn fail_always(self, task_id: impl Into<TaskId>, exit_code: i32) -> Self {
        lock(&self.scripts).insert(task_id.into(), Script::FailAlways { exit_code });
        self
    }

    /// Configure a task to fail `times` times, then succeed.
    pub fn fail_times(self, task_id: impl Into<TaskId>, times: u32, exit_code: i32) -> Self {
        lock(&self.scripts).insert(
            task_id.into(),
            Script::FailTimes {
                remaining: times,
                exit_code,
            },
        );
        self
    }

    /// Configure a task to be handed off instead of run.
    pub fn inject(self, task_id: impl Into<TaskId>) -> Self {
        lock(&self.scripts).insert(task_id.into(), Script::Inject);
        self
    }

    /// Configure a task's session to be missing.
    pub fn unavailable(self, task_id: impl Into<TaskId>) -> Self {
        lock(&self.scripts).insert(task_id.into(), Script::Unavailable);
        self
    }

    /// Make every dispatch take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Make dispatches of one task take `delay`.
    pub fn with_task_delay(mut self, task_id: impl Into<TaskId>, delay: Duration) -> Self {
        self.delays.insert(task_id.into(), delay);
        self
    }

    /// Every dispatched task id, in dispatch order, one entry per attempt.
    pub fn invocations(&self) -> Vec<TaskId> {
        lock(&self.invocations).clone()
    }

    /// Number of attempts dispatched for a task.
    pub fn invocation_count(&self, task_id: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }

    pub fn total_invocations(&self) -> usize {
        lock(&self.invocations).len()
    }

    /// Highest number of dispatches that were in progress at once.
    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Forget recorded invocations, keeping the scripts.
    pub fn reset_invocations(&self) {
        lock(&self.invocations).clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    fn next_outcome(&self, task_id: &TaskId) -> Result<Dispatch, SessionError> {
        let mut scripts = lock(&self.scripts);
        let completed = |exit_code: i32| {
            Dispatch::Completed(CommandOutput {
                exit_code,
                stdout: format!("{} ran", task_id),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("{} failed", task_id)
                },
            })
        };

        match scripts.get_mut(task_id) {
            None => Ok(completed(0)),
            Some(Script::FailAlways { exit_code }) => Ok(completed(*exit_code)),
            Some(Script::FailTimes {
                remaining,
                exit_code,
            }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Ok(completed(*exit_code))
                } else {
                    Ok(completed(0))
                }
            }
            Some(Script::Inject) => Ok(Dispatch::Injected {
                target: "scripted".to_string(),
            }),
            Some(Script::Unavailable) => Err(SessionError::Unavailable(task_id.to_string())),
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn dispatch(&self, request: &SessionRequest) -> Result<Dispatch, SessionError> {
        lock(&self.invocations).push(request.task_id.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self
            .delays
            .get(&request.task_id)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.next_outcome(&request.task_id)
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Event type names, in order.
    pub async fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(Event::kind).collect()
    }

    /// Event type names for one task, in order.
    pub async fn kinds_for(&self, task_id: &str) -> Vec<&'static str> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.task_id().map(TaskId::as_str) == Some(task_id))
            .map(Event::kind)
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A test harness for running workflows with in-memory storage.
///
/// # Example
///
/// ```ignore
/// use dagflow::testing::{ScriptedSession, TestHarness};
///
/// let harness = TestHarness::new(ScriptedSession::new().fail_always("b", 1)).await;
/// let result = harness.execute_and_assert_failure(&workflow).await;
/// assert_eq!(result.report.failed.len(), 1);
/// ```
pub struct TestHarness {
    orchestrator: Orchestrator,
    store: Arc<InMemoryCheckpointStore>,
    session: Arc<ScriptedSession>,
    recorder: Arc<RecordingHandler>,
}

/// Result from TestHarness execution.
pub struct TestResult {
    pub report: RunReport,
    pub events: Vec<Event>,
}

impl TestHarness {
    /// Create a harness whose local and named sessions are all `session`.
    pub async fn new(session: ScriptedSession) -> Self {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let session = Arc::new(session);
        let recorder = Arc::new(RecordingHandler::new());
        let events = Arc::new(EventBus::new());
        events.register(recorder.clone()).await;

        let sessions = SessionRegistry::new(session.clone()).with_external(session.clone());
        let orchestrator = Orchestrator::new(store.clone(), events)
            .with_sessions(sessions)
            .with_cancel_poll_interval(Duration::from_millis(10));

        Self {
            orchestrator,
            store,
            session,
            recorder,
        }
    }

    /// Set the bound on concurrently running tasks.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.orchestrator = self.orchestrator.with_max_parallel(max_parallel);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> Arc<InMemoryCheckpointStore> {
        Arc::clone(&self.store)
    }

    pub fn checkpoint(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    pub fn session(&self) -> &ScriptedSession {
        &self.session
    }

    pub fn recorder(&self) -> &RecordingHandler {
        &self.recorder
    }

    /// Run a workflow with the given options.
    pub async fn run(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> Result<TestResult, OrchestratorError> {
        let report = self.orchestrator.run(workflow, options).await?;
        Ok(TestResult {
            report,
            events: self.recorder.events().await,
        })
    }

    /// Run a workflow as a fresh run.
    ///
    /// # Panics
    ///
    /// Panics if the workflow is rejected before running.
    pub async fn execute(&self, workflow: &Workflow) -> TestResult {
        match self.run(workflow, RunOptions::new()).await {
            Ok(result) => result,
            Err(e) => panic!("workflow '{}' was rejected: {}", workflow.name(), e),
        }
    }

    /// Execute and assert success.
    pub async fn execute_and_assert_success(&self, workflow: &Workflow) -> TestResult {
        let result = self.execute(workflow).await;
        assert!(
            result.report.is_success(),
            "Expected workflow to succeed, but it ended {}. Failed tasks: {:?}",
            result.report.status,
            result.report.failed
        );
        result
    }

    /// Execute and assert failure.
    pub async fn execute_and_assert_failure(&self, workflow: &Workflow) -> TestResult {
        let result = self.execute(workflow).await;
        assert!(
            !result.report.is_success(),
            "Expected workflow to fail, but it succeeded"
        );
        result
    }
}
