//! Lifecycle events and event handling.
//!
//! The orchestrator emits an [`Event`] for every workflow and task transition.
//! Handlers registered on the [`EventBus`] receive them in emission order;
//! [`EventStreamWriter`] renders them onto an append-only log.

mod stream;

pub use stream::{
    AppendLog, EventStreamWriter, FileAppendLog, MemoryAppendLog, SinkError, format_line,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::checkpoint::{RunStatus, TaskStatus};
use crate::core::types::{RunId, TaskId};

/// Lifecycle events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The run entered `running`.
    WorkflowStarted {
        run_id: RunId,
        workflow: String,
        total_tasks: usize,
        /// Tasks already complete from a previous attempt.
        resumed_tasks: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task attempt was handed to its session.
    TaskStarted {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        session: String,
        timestamp: DateTime<Utc>,
    },

    /// A task attempt failed and another attempt follows.
    TaskRetrying {
        run_id: RunId,
        task_id: TaskId,
        /// The attempt that just failed (1-indexed).
        attempt: u32,
        /// Total attempts allowed, including the first.
        max_attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A task reached terminal-success.
    TaskCompleted {
        run_id: RunId,
        task_id: TaskId,
        status: TaskStatus,
        attempt: u32,
        exit_code: Option<i32>,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// A task failed for good.
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        exit_code: Option<i32>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The run finished as completed or failed.
    WorkflowCompleted {
        run_id: RunId,
        status: RunStatus,
        completed: usize,
        failed: usize,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// The run finished because cancellation was requested.
    WorkflowCancelled {
        run_id: RunId,
        completed: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::WorkflowStarted { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskRetrying { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::WorkflowCompleted { timestamp, .. }
            | Event::WorkflowCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Run the event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Event::WorkflowStarted { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskRetrying { run_id, .. }
            | Event::TaskCompleted { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::WorkflowCompleted { run_id, .. }
            | Event::WorkflowCancelled { run_id, .. } => run_id,
        }
    }

    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::TaskRetrying { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::WorkflowStarted { .. } => "WORKFLOW_START",
            Event::TaskStarted { .. } => "TASK_START",
            Event::TaskRetrying { .. } => "TASK_RETRY",
            Event::TaskCompleted { .. } => "TASK_COMPLETE",
            Event::TaskFailed { .. } => "TASK_FAILED",
            Event::WorkflowCompleted { .. } => "WORKFLOW_COMPLETE",
            Event::WorkflowCancelled { .. } => "WORKFLOW_CANCEL",
        }
    }

    /// Key/value payload in a stable order.
    pub fn payload(&self) -> Vec<(&'static str, String)> {
        match self {
            Event::WorkflowStarted {
                run_id,
                workflow,
                total_tasks,
                resumed_tasks,
                ..
            } => vec![
                ("workflow_id", run_id.to_string()),
                ("name", workflow.clone()),
                ("tasks", total_tasks.to_string()),
                ("resumed", resumed_tasks.to_string()),
            ],
            Event::TaskStarted {
                run_id,
                task_id,
                attempt,
                session,
                ..
            } => vec![
                ("workflow_id", run_id.to_string()),
                ("task", task_id.to_string()),
                ("attempt", attempt.to_string()),
                ("session", session.clone()),
            ],
            Event::TaskRetrying {
                run_id,
                task_id,
                attempt,
                max_attempts,
                error,
                ..
            } => vec![
                ("workflow_id", run_id.to_string()),
                ("task", task_id.to_string()),
                ("attempt", attempt.to_string()),
                ("max", max_attempts.to_string()),
                ("error", error.clone()),
            ],
            Event::TaskCompleted {
                run_id,
                task_id,
                status,
                attempt,
                exit_code,
                duration,
                ..
            } => {
                let mut fields = vec![
                    ("workflow_id", run_id.to_string()),
                    ("task", task_id.to_string()),
                    ("status", status.to_string()),
                    ("attempt", attempt.to_string()),
                ];
                if let Some(code) = exit_code {
                    fields.push(("exit_code", code.to_string()));
                }
                fields.push(("duration_ms", duration.as_millis().to_string()));
                fields
            }
            Event::TaskFailed {
                run_id,
                task_id,
                attempt,
                exit_code,
                error,
                ..
            } => {
                let mut fields = vec![
                    ("workflow_id", run_id.to_string()),
                    ("task", task_id.to_string()),
                    ("attempt", attempt.to_string()),
                ];
                if let Some(code) = exit_code {
                    fields.push(("exit_code", code.to_string()));
                }
                fields.push(("error", error.clone()));
                fields
            }
            Event::WorkflowCompleted {
                run_id,
                status,
                completed,
                failed,
                duration,
                ..
            } => vec![
                ("workflow_id", run_id.to_string()),
                ("status", status.to_string()),
                ("completed", completed.to_string()),
                ("failed", failed.to_string()),
                ("duration_ms", duration.as_millis().to_string()),
            ],
            Event::WorkflowCancelled {
                run_id,
                completed,
                failed,
                ..
            } => vec![
                ("workflow_id", run_id.to_string()),
                ("completed", completed.to_string()),
                ("failed", failed.to_string()),
            ],
        }
    }
}

/// Handler for receiving lifecycle events.
///
/// Handlers must not fail the run; sinks log their own errors.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
