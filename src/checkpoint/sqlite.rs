//! SQLite checkpoint store.
//!
//! Provides persistent storage using a SQLite database. Read-modify-write
//! operations run inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use super::{
    CheckpointError, CheckpointStore, RunRecord, RunStatus, RunSummary, TaskResult, TaskStatus,
};
use crate::core::types::{RunId, TaskId};

type RunRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
    Option<String>,
);

type TaskRow = (
    String,
    String,
    Option<i64>,
    i64,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
);

const RUN_COLUMNS: &str = "run_id, workflow_name, status, created_at, started_at, finished_at, \
                           tasks_completed, tasks_failed, error";

const TASK_COLUMNS: &str =
    "task_id, status, exit_code, duration_ms, attempt, error, started_at, finished_at";

/// SQLite checkpoint backend.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), CheckpointError> {
        let schema = include_str!("../../migrations/001_checkpoint_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_run(
        tx: &mut Transaction<'_, Sqlite>,
        run_id: &RunId,
    ) -> Result<Option<RunRecord>, CheckpointError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {} FROM runs WHERE run_id = ?", RUN_COLUMNS))
                .bind(run_id.as_str())
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_err)?;
        row.map(run_from_row).transpose()
    }

    async fn save_run(
        tx: &mut Transaction<'_, Sqlite>,
        record: &RunRecord,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            UPDATE runs SET status = ?, started_at = ?, finished_at = ?,
                tasks_completed = ?, tasks_failed = ?, error = ?
            WHERE run_id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.started_at.map(|t| t.to_rfc3339()))
        .bind(record.finished_at.map(|t| t.to_rfc3339()))
        .bind(record.tasks_completed as i64)
        .bind(record.tasks_failed as i64)
        .bind(&record.error)
        .bind(record.run_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Other(e.to_string())
}

fn not_found(run_id: &RunId) -> CheckpointError {
    CheckpointError::NotFound(format!("run: {}", run_id))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CheckpointError::Serialization(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>, CheckpointError> {
    s.as_deref().map(parse_time).transpose()
}

fn run_from_row(row: RunRow) -> Result<RunRecord, CheckpointError> {
    let status = RunStatus::parse(&row.2)
        .ok_or_else(|| CheckpointError::Serialization(format!("unknown run status '{}'", row.2)))?;
    Ok(RunRecord {
        run_id: RunId::new(row.0),
        workflow_name: row.1,
        status,
        created_at: parse_time(&row.3)?,
        started_at: parse_opt_time(row.4)?,
        finished_at: parse_opt_time(row.5)?,
        tasks_completed: row.6 as usize,
        tasks_failed: row.7 as usize,
        error: row.8,
    })
}

fn task_from_row(row: TaskRow) -> Result<TaskResult, CheckpointError> {
    let status = TaskStatus::parse(&row.1)
        .ok_or_else(|| CheckpointError::Serialization(format!("unknown task status '{}'", row.1)))?;
    Ok(TaskResult {
        task_id: TaskId::new(row.0),
        status,
        exit_code: row.2.map(|c| c as i32),
        duration_ms: row.3 as u64,
        attempt: row.4 as u32,
        error: row.5,
        started_at: parse_opt_time(row.6)?,
        finished_at: parse_opt_time(row.7)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn init_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
    ) -> Result<RunRecord, CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(existing) = Self::fetch_run(&mut tx, run_id).await? {
            if !existing.status.is_terminal() {
                return Err(CheckpointError::DuplicateRun(run_id.clone()));
            }
            for table in ["runs", "task_results", "attempt_logs"] {
                sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", table))
                    .bind(run_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        let record = RunRecord::new(run_id.clone(), workflow_name);
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, workflow_name, status, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run_id.as_str())
        .bind(workflow_name)
        .bind(record.status.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {} FROM runs WHERE run_id = ?", RUN_COLUMNS))
                .bind(run_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(run_from_row)
            .transpose()?
            .ok_or_else(|| not_found(run_id))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs ORDER BY created_at, run_id",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> Result<RunRecord, CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut record = Self::fetch_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| not_found(run_id))?;
        record.transition(status, summary)?;
        Self::save_run(&mut tx, &record).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn reopen_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut record = Self::fetch_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| not_found(run_id))?;
        record.reopen();
        Self::save_run(&mut tx, &record).await?;
        sqlx::query("UPDATE runs SET cancel_requested = 0 WHERE run_id = ?")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["runs", "task_results", "attempt_logs"] {
            sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", table))
                .bind(run_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn record_task_result(
        &self,
        run_id: &RunId,
        result: TaskResult,
    ) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if Self::fetch_run(&mut tx, run_id).await?.is_none() {
            return Err(not_found(run_id));
        }

        let existing: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM task_results WHERE run_id = ? AND task_id = ?",
            TASK_COLUMNS
        ))
        .bind(run_id.as_str())
        .bind(result.task_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let existing = existing.map(task_from_row).transpose()?;
        result.check_overwrite(existing.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO task_results
                (run_id, task_id, status, exit_code, duration_ms, attempt, error, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id, task_id) DO UPDATE SET
                status = excluded.status,
                exit_code = excluded.exit_code,
                duration_ms = excluded.duration_ms,
                attempt = excluded.attempt,
                error = excluded.error,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(run_id.as_str())
        .bind(result.task_id.as_str())
        .bind(result.status.as_str())
        .bind(result.exit_code.map(i64::from))
        .bind(result.duration_ms as i64)
        .bind(i64::from(result.attempt))
        .bind(&result.error)
        .bind(result.started_at.map(|t| t.to_rfc3339()))
        .bind(result.finished_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
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
        self.get_run(run_id).await?;
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM task_results WHERE run_id = ? ORDER BY task_id",
            TASK_COLUMNS
        ))
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(task_from_row).collect()
    }

    async fn invalidate_tasks(
        &self,
        run_id: &RunId,
        tasks: &[TaskId],
    ) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for task in tasks {
            sqlx::query("DELETE FROM task_results WHERE run_id = ? AND task_id = ?")
                .bind(run_id.as_str())
                .bind(task.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn append_attempt_log(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        attempt: u32,
        content: &str,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO attempt_logs (run_id, task_id, attempt, content)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run_id, task_id, attempt) DO UPDATE SET
                content = attempt_logs.content || excluded.content
            "#,
        )
        .bind(run_id.as_str())
        .bind(task_id.as_str())
        .bind(i64::from(attempt))
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let record = Self::fetch_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| not_found(run_id))?;
        if record.status.is_terminal() {
            return Err(CheckpointError::InvalidTransition {
                run_id: run_id.clone(),
                from: record.status,
                to: RunStatus::Cancelled,
            });
        }
        sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE run_id = ?")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn cancel_requested(&self, run_id: &RunId) -> Result<bool, CheckpointError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT cancel_requested FROM runs WHERE run_id = ?")
                .bind(run_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(|(flag,)| flag != 0).ok_or_else(|| not_found(run_id))
    }
}
