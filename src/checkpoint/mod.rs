//! Checkpoint store: durable run and task state for resume.
//!
//! This module provides the [`CheckpointStore`] trait with pluggable backends
//! (in-memory, JSON files, SQLite). The rules that keep resume correct live
//! on the record types so every backend enforces them the same way:
//!
//! - a run moves `initialized → running → {completed, failed, cancelled}`;
//! - a terminal-success task result is never replaced by a non-success result
//!   for the same or an earlier attempt.

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{EngineConfig, StorageConfig};
use crate::core::types::{RunId, TaskId};

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A non-terminal run already exists under this id.
    #[error("run '{0}' already exists and is not finished")]
    DuplicateRun(RunId),

    /// The requested status change is not allowed.
    #[error("invalid run transition for '{run_id}': {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A terminal-success result would be overwritten by a weaker one.
    #[error("task '{task_id}' already succeeded at attempt {attempt}")]
    SuccessProtected { task_id: TaskId, attempt: u32 },

    /// Storage lock was poisoned.
    #[error("checkpoint lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic backend error.
    #[error("checkpoint error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self → to` is a legal lifecycle step.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Initialized, RunStatus::Running)
                | (
                    RunStatus::Running,
                    RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
                )
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(RunStatus::Initialized),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Resolved without running (dry run).
    DryRun,
    /// Handed to an external session; real outcome unknown.
    Injected,
}

impl TaskStatus {
    /// Statuses after which resume never re-executes the task.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::DryRun | TaskStatus::Injected
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal_success() || matches!(self, TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::DryRun => "dry_run",
            TaskStatus::Injected => "injected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "dry_run" => Some(TaskStatus::DryRun),
            "injected" => Some(TaskStatus::Injected),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counts attached to a run status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(tasks_completed: usize, tasks_failed: usize) -> Self {
        Self {
            tasks_completed,
            tasks_failed,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Persisted workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub error: Option<String>,
}

impl RunRecord {
    /// Create a new record in `initialized` status.
    pub fn new(run_id: RunId, workflow_name: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            status: RunStatus::Initialized,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
            error: None,
        }
    }

    /// Apply a lifecycle transition, rejecting illegal ones.
    pub fn transition(&mut self, to: RunStatus, summary: RunSummary) -> Result<(), CheckpointError> {
        if !self.status.can_transition_to(to) {
            return Err(CheckpointError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if to == RunStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        self.tasks_completed = summary.tasks_completed;
        self.tasks_failed = summary.tasks_failed;
        self.error = summary.error;
        Ok(())
    }

    /// Put the run back into `initialized` for a resume.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Initialized;
        self.finished_at = None;
        self.error = None;
    }
}

/// Outcome record for one task in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// A task that has just been dispatched.
    pub fn running(task_id: TaskId, attempt: u32) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            exit_code: None,
            duration_ms: 0,
            attempt,
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// A finished task.
    pub fn finished(task_id: TaskId, status: TaskStatus, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status,
            exit_code: None,
            duration_ms: 0,
            attempt,
            error: None,
            started_at: Some(now),
            finished_at: Some(now),
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn is_terminal_success(&self) -> bool {
        self.status.is_terminal_success()
    }

    /// Check that writing `self` over `existing` keeps resume sound.
    pub fn check_overwrite(&self, existing: Option<&TaskResult>) -> Result<(), CheckpointError> {
        match existing {
            Some(prev)
                if prev.is_terminal_success()
                    && !self.is_terminal_success()
                    && self.attempt <= prev.attempt =>
            {
                Err(CheckpointError::SuccessProtected {
                    task_id: prev.task_id.clone(),
                    attempt: prev.attempt,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Durable run and task state, keyed by run id then task id.
///
/// Implementations must be safe to share across tasks; the orchestrator is
/// the single logical writer for any one run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create a run in `initialized` status.
    ///
    /// Fails with [`CheckpointError::DuplicateRun`] if a non-terminal run
    /// exists under the id. A terminal run under the id is replaced.
    async fn init_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
    ) -> Result<RunRecord, CheckpointError>;

    /// Get a run by id.
    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError>;

    /// List every known run, oldest first.
    async fn list_runs(&self) -> Result<Vec<RunRecord>, CheckpointError>;

    /// Transition a run's status.
    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> Result<RunRecord, CheckpointError>;

    /// Reset a run to `initialized`, keeping its task results and clearing
    /// any cancellation request.
    async fn reopen_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError>;

    /// Remove a run and everything recorded under it. Missing runs are fine.
    async fn delete_run(&self, run_id: &RunId) -> Result<(), CheckpointError>;

    /// Upsert a task result.
    async fn record_task_result(
        &self,
        run_id: &RunId,
        result: TaskResult,
    ) -> Result<(), CheckpointError>;

    /// Task ids whose last recorded result is terminal-success.
    async fn load_completed(&self, run_id: &RunId) -> Result<HashSet<TaskId>, CheckpointError>;

    /// All task results of a run.
    async fn list_task_results(&self, run_id: &RunId) -> Result<Vec<TaskResult>, CheckpointError>;

    /// Forget the results of the given tasks so they run again.
    async fn invalidate_tasks(
        &self,
        run_id: &RunId,
        tasks: &[TaskId],
    ) -> Result<(), CheckpointError>;

    /// Store the log of one task attempt.
    async fn append_attempt_log(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        attempt: u32,
        content: &str,
    ) -> Result<(), CheckpointError>;

    /// Ask a running orchestrator to stop dispatching.
    async fn request_cancel(&self, run_id: &RunId) -> Result<(), CheckpointError>;

    /// Whether cancellation has been requested for the run.
    async fn cancel_requested(&self, run_id: &RunId) -> Result<bool, CheckpointError>;
}

/// Open the checkpoint store selected by the engine config.
pub async fn open_store(
    config: &EngineConfig,
) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    match &config.storage {
        StorageConfig::Memory => Ok(Arc::new(InMemoryCheckpointStore::new())),
        StorageConfig::File => Ok(Arc::new(FileCheckpointStore::new(&config.state_dir))),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteCheckpointStore::new(path).await?)),
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err(CheckpointError::Other(
            "sqlite storage requires the `sqlite` feature".into(),
        )),
    }
}
