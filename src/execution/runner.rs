//! Single-task execution.
//!
//! The `TaskRunner` drives one task through its attempts:
//! - resolves the session adapter for the task's target
//! - bounds every attempt by the task's timeout
//! - retries according to the task's retry policy
//! - stores a log for every attempt
//!
//! It returns a terminal [`TaskResult`] and leaves recording it to the
//! orchestrator, which is the single writer of run state.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointStore, TaskResult, TaskStatus};
use crate::core::task::{TaskError, TaskSpec};
use crate::core::types::RunId;
use crate::events::{Event, EventBus};
use crate::session::{CommandOutput, Dispatch, Session, SessionError, SessionRegistry, SessionRequest};

/// Terminal outcome of running a task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Result to record; its status is terminal.
    pub result: TaskResult,
    /// Error of the last attempt when the task failed.
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    /// Whether the task reached terminal-success.
    pub fn succeeded(&self) -> bool {
        self.result.is_terminal_success()
    }
}

/// What a single attempt produced.
enum Attempt {
    Succeeded {
        status: TaskStatus,
        exit_code: Option<i32>,
    },
    Failed(TaskError),
}

/// Runs tasks with timeout and retry handling.
pub struct TaskRunner {
    sessions: SessionRegistry,
    checkpoint: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
}

impl TaskRunner {
    pub fn new(
        sessions: SessionRegistry,
        checkpoint: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions,
            checkpoint,
            events,
        }
    }

    /// Run a task to a terminal result.
    ///
    /// In dry-run mode no session is ever contacted and the task resolves
    /// immediately to `dry_run`.
    pub async fn run(&self, run_id: &RunId, task: &TaskSpec, dry_run: bool) -> TaskOutcome {
        let started_at = Utc::now();
        let start = Instant::now();

        if dry_run {
            debug!(task = %task.id, "dry run, skipping dispatch");
            return TaskOutcome {
                result: TaskResult::finished(task.id.clone(), TaskStatus::DryRun, 1)
                    .with_started_at(started_at),
                error: None,
            };
        }

        let max_attempts = task.retry.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = match self.sessions.resolve(&task.session) {
                Ok(session) => self.attempt(run_id, task, session.as_ref(), attempt).await,
                Err(e) => {
                    let error = session_error(e);
                    self.write_attempt_log(run_id, task, attempt, &format_failure(task, &error))
                        .await;
                    Attempt::Failed(error)
                }
            };

            let elapsed_ms = start.elapsed().as_millis() as u64;
            match outcome {
                Attempt::Succeeded { status, exit_code } => {
                    return TaskOutcome {
                        result: TaskResult::finished(task.id.clone(), status, attempt)
                            .with_started_at(started_at)
                            .with_exit_code(exit_code)
                            .with_duration_ms(elapsed_ms),
                        error: None,
                    };
                }
                Attempt::Failed(error) => {
                    if error.is_retryable() && task.retry.should_retry(attempt) {
                        warn!(
                            task = %task.id,
                            attempt,
                            max_attempts,
                            error = %error,
                            "task attempt failed, retrying"
                        );
                        self.events
                            .emit(Event::TaskRetrying {
                                run_id: run_id.clone(),
                                task_id: task.id.clone(),
                                attempt,
                                max_attempts,
                                error: error.to_string(),
                                timestamp: Utc::now(),
                            })
                            .await;

                        let delay = task.retry.delay_after(attempt);
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        continue;
                    }

                    return TaskOutcome {
                        result: TaskResult::finished(task.id.clone(), TaskStatus::Failed, attempt)
                            .with_started_at(started_at)
                            .with_exit_code(error.exit_code())
                            .with_duration_ms(elapsed_ms)
                            .with_error(error.to_string()),
                        error: Some(error),
                    };
                }
            }
        }
    }

    /// Make one attempt through the given session.
    async fn attempt(
        &self,
        run_id: &RunId,
        task: &TaskSpec,
        session: &dyn Session,
        attempt: u32,
    ) -> Attempt {
        let request = SessionRequest {
            task_id: task.id.clone(),
            command: task.command.clone(),
            target: task.session.clone(),
            env: task.env.clone(),
        };

        debug!(
            task = %task.id,
            attempt,
            session = session.name(),
            "dispatching command"
        );

        // Dropping the dispatch future on timeout kills a local child.
        let (outcome, log) = match timeout(task.timeout, session.dispatch(&request)).await {
            Ok(Ok(Dispatch::Completed(output))) => {
                let log = format_output(task, &output);
                if output.success() {
                    (
                        Attempt::Succeeded {
                            status: TaskStatus::Success,
                            exit_code: Some(output.exit_code),
                        },
                        log,
                    )
                } else {
                    let error = TaskError::CommandFailed {
                        exit_code: output.exit_code,
                    };
                    (Attempt::Failed(error), log)
                }
            }
            Ok(Ok(Dispatch::Injected { target })) => (
                Attempt::Succeeded {
                    status: TaskStatus::Injected,
                    exit_code: None,
                },
                format!(
                    "command: {}\nsession: {}\nresult: injected into {}\n",
                    task.command, task.session, target
                ),
            ),
            Ok(Err(e)) => {
                let error = session_error(e);
                let log = format_failure(task, &error);
                (Attempt::Failed(error), log)
            }
            Err(_) => {
                let error = TaskError::TimedOut(task.timeout);
                let log = format_failure(task, &error);
                (Attempt::Failed(error), log)
            }
        };

        self.write_attempt_log(run_id, task, attempt, &log).await;
        outcome
    }

    async fn write_attempt_log(&self, run_id: &RunId, task: &TaskSpec, attempt: u32, log: &str) {
        if let Err(e) = self
            .checkpoint
            .append_attempt_log(run_id, &task.id, attempt, log)
            .await
        {
            warn!(task = %task.id, attempt, error = %e, "failed to store attempt log");
        }
    }
}

fn session_error(error: SessionError) -> TaskError {
    match error {
        SessionError::Unavailable(name) => TaskError::SessionUnavailable(name),
        other => TaskError::ExecutionFailed(other.to_string()),
    }
}

fn format_output(task: &TaskSpec, output: &CommandOutput) -> String {
    format!(
        "command: {}\nsession: {}\nexit_code: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        task.command, task.session, output.exit_code, output.stdout, output.stderr
    )
}

fn format_failure(task: &TaskSpec, error: &TaskError) -> String {
    format!(
        "command: {}\nsession: {}\nerror: {}\n",
        task.command, task.session, error
    )
}
