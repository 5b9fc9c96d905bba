//! In-memory checkpoint store.
//!
//! Thread-safe and non-persistent. Used for tests and dry runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use super::{CheckpointError, CheckpointStore, RunRecord, RunStatus, RunSummary, TaskResult};
use crate::core::types::{RunId, TaskId};

#[derive(Debug, Clone)]
struct RunEntry {
    record: RunRecord,
    tasks: BTreeMap<TaskId, TaskResult>,
    logs: BTreeMap<(TaskId, u32), String>,
    cancel_requested: bool,
}

impl RunEntry {
    fn new(record: RunRecord) -> Self {
        Self {
            record,
            tasks: BTreeMap::new(),
            logs: BTreeMap::new(),
            cancel_requested: false,
        }
    }
}

/// In-memory checkpoint backend.
pub struct InMemoryCheckpointStore {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl InMemoryCheckpointStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Logs recorded for a task, ordered by attempt.
    pub fn attempt_logs(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Vec<String>, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry
            .logs
            .iter()
            .filter(|((task, _), _)| task == task_id)
            .map(|(_, content)| content.clone())
            .collect())
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(run_id: &RunId) -> CheckpointError {
    CheckpointError::NotFound(format!("run: {}", run_id))
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn init_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
    ) -> Result<RunRecord, CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        if let Some(existing) = runs.get(run_id)
            && !existing.record.status.is_terminal()
        {
            return Err(CheckpointError::DuplicateRun(run_id.clone()));
        }
        let record = RunRecord::new(run_id.clone(), workflow_name);
        runs.insert(run_id.clone(), RunEntry::new(record.clone()));
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        runs.get(run_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| not_found(run_id))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        let mut result: Vec<_> = runs.values().map(|entry| entry.record.clone()).collect();
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(result)
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> Result<RunRecord, CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        entry.record.transition(status, summary)?;
        Ok(entry.record.clone())
    }

    async fn reopen_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        entry.record.reopen();
        entry.cancel_requested = false;
        Ok(entry.record.clone())
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        runs.remove(run_id);
        Ok(())
    }

    async fn record_task_result(
        &self,
        run_id: &RunId,
        result: TaskResult,
    ) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        result.check_overwrite(entry.tasks.get(&result.task_id))?;
        entry.tasks.insert(result.task_id.clone(), result);
        Ok(())
    }

    async fn load_completed(&self, run_id: &RunId) -> Result<HashSet<TaskId>, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry
            .tasks
            .values()
            .filter(|r| r.is_terminal_success())
            .map(|r| r.task_id.clone())
            .collect())
    }

    async fn list_task_results(&self, run_id: &RunId) -> Result<Vec<TaskResult>, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry.tasks.values().cloned().collect())
    }

    async fn invalidate_tasks(
        &self,
        run_id: &RunId,
        tasks: &[TaskId],
    ) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        for task in tasks {
            entry.tasks.remove(task);
        }
        Ok(())
    }

    async fn append_attempt_log(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        attempt: u32,
        content: &str,
    ) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        entry
            .logs
            .entry((task_id.clone(), attempt))
            .or_default()
            .push_str(content);
        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        if entry.record.status.is_terminal() {
            return Err(CheckpointError::InvalidTransition {
                run_id: run_id.clone(),
                from: entry.record.status,
                to: RunStatus::Cancelled,
            });
        }
        entry.cancel_requested = true;
        Ok(())
    }

    async fn cancel_requested(&self, run_id: &RunId) -> Result<bool, CheckpointError> {
        let runs = self.runs.read().map_err(|_| CheckpointError::LockPoisoned)?;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry.cancel_requested)
    }
}
