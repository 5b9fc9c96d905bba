//! JSON-file checkpoint store.
//!
//! Layout under the root directory:
//!
//! ```text
//! runs/<run>/run.json
//! runs/<run>/tasks/<task>.json
//! runs/<run>/logs/<task>.<attempt>.log
//! runs/<run>/cancel
//! locks/<run>.lock
//! ```
//!
//! Records are written to a temporary file and renamed into place, so a crash
//! never leaves a half-written record behind.
//!
//! Creating a run first claims `locks/<run>.lock` with an exclusive create, so
//! two processes sharing a state directory cannot both start the same run.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{CheckpointError, CheckpointStore, RunRecord, RunStatus, RunSummary, TaskResult};
use crate::core::types::{RunId, TaskId};

/// A run lock older than this is left over from a crashed process.
const STALE_INIT_LOCK: Duration = Duration::from_secs(30);

/// File-backed checkpoint store.
pub struct FileCheckpointStore {
    root: PathBuf,
    // Serializes read-modify-write sequences within this process.
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(file_component(run_id.as_str()))
    }

    fn run_file(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn tasks_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("tasks")
    }

    fn task_file(&self, run_id: &RunId, task_id: &TaskId) -> PathBuf {
        self.tasks_dir(run_id)
            .join(format!("{}.json", file_component(task_id.as_str())))
    }

    fn cancel_file(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("cancel")
    }

    fn init_lock_file(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", file_component(run_id.as_str())))
    }

    /// Exclusively claim the right to create `run_id`.
    ///
    /// Fails with `DuplicateRun` while another store, in this process or any
    /// other, holds the claim.
    async fn claim_init(&self, run_id: &RunId) -> Result<InitClaim, CheckpointError> {
        let path = self.init_lock_file(run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut reclaimed = false;
        loop {
            let opened = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    return Ok(InitClaim { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if reclaimed || !lock_is_stale(&path).await? {
                        return Err(CheckpointError::DuplicateRun(run_id.clone()));
                    }
                    warn!(
                        run_id = %run_id,
                        path = %path.display(),
                        "Removing stale run lock"
                    );
                    remove_if_exists(&path).await?;
                    reclaimed = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Path of the log for one task attempt.
    pub fn attempt_log_path(&self, run_id: &RunId, task_id: &TaskId, attempt: u32) -> PathBuf {
        self.run_dir(run_id).join("logs").join(format!(
            "{}.{}.log",
            file_component(task_id.as_str()),
            attempt
        ))
    }

    async fn load_record(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        read_json(&self.run_file(run_id))
            .await?
            .ok_or_else(|| CheckpointError::NotFound(format!("run: {}", run_id)))
    }

    async fn ensure_run(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        if fs::try_exists(self.run_file(run_id)).await? {
            Ok(())
        } else {
            Err(CheckpointError::NotFound(format!("run: {}", run_id)))
        }
    }
}

/// Percent-encode anything that is not safe in a single path component.
fn file_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn lock_is_stale(path: &Path) -> Result<bool, CheckpointError> {
    let modified = match fs::metadata(path).await {
        Ok(meta) => meta.modified()?,
        // Released between the failed create and this check.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > STALE_INIT_LOCK))
}

/// Held while a run is being created; removes the lock file when dropped.
struct InitClaim {
    path: PathBuf,
}

impl Drop for InitClaim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), CheckpointError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn init_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
    ) -> Result<RunRecord, CheckpointError> {
        let _guard = self.lock.lock().await;
        let _claim = self.claim_init(run_id).await?;

        if let Some(existing) = read_json::<RunRecord>(&self.run_file(run_id)).await? {
            if !existing.status.is_terminal() {
                return Err(CheckpointError::DuplicateRun(run_id.clone()));
            }
            fs::remove_dir_all(self.run_dir(run_id)).await?;
        }

        let record = RunRecord::new(run_id.clone(), workflow_name);
        write_json(&self.run_file(run_id), &record).await?;
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        self.load_record(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        let mut entries = match fs::read_dir(self.runs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join("run.json");
            if let Some(record) = read_json::<RunRecord>(&path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> Result<RunRecord, CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load_record(run_id).await?;
        record.transition(status, summary)?;
        write_json(&self.run_file(run_id), &record).await?;
        Ok(record)
    }

    async fn reopen_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load_record(run_id).await?;
        record.reopen();
        write_json(&self.run_file(run_id), &record).await?;
        remove_if_exists(&self.cancel_file(run_id)).await?;
        Ok(record)
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        match fs::remove_dir_all(self.run_dir(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_task_result(
        &self,
        run_id: &RunId,
        result: TaskResult,
    ) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        self.ensure_run(run_id).await?;

        let path = self.task_file(run_id, &result.task_id);
        let existing: Option<TaskResult> = read_json(&path).await?;
        result.check_overwrite(existing.as_ref())?;
        write_json(&path, &result).await
    }

    async fn load_completed(&self, run_id: &RunId) -> Result<HashSet<TaskId>, CheckpointError> {
        Ok(self
            .list_task_results(run_id)
            .await?
            .into_iter()
            .filter(|r| r.is_terminal_success())
            .map(|r| r.task_id)
            .collect())
    }

    async fn list_task_results(&self, run_id: &RunId) -> Result<Vec<TaskResult>, CheckpointError> {
        self.ensure_run(run_id).await?;

        let mut entries = match fs::read_dir(self.tasks_dir(run_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(result) = read_json::<TaskResult>(&path).await?
            {
                results.push(result);
            }
        }
        results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(results)
    }

    async fn invalidate_tasks(
        &self,
        run_id: &RunId,
        tasks: &[TaskId],
    ) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        self.ensure_run(run_id).await?;
        for task in tasks {
            remove_if_exists(&self.task_file(run_id, task)).await?;
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
        let path = self.attempt_log_path(run_id, task_id, attempt);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let record = self.load_record(run_id).await?;
        if record.status.is_terminal() {
            return Err(CheckpointError::InvalidTransition {
                run_id: run_id.clone(),
                from: record.status,
                to: RunStatus::Cancelled,
            });
        }
        fs::write(self.cancel_file(run_id), chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }

    async fn cancel_requested(&self, run_id: &RunId) -> Result<bool, CheckpointError> {
        Ok(fs::try_exists(self.cancel_file(run_id)).await?)
    }
}
