//! Resume and checkpoint recovery tests.

use crate::common::{diamond, pipeline};
use async_trait::async_trait;
use dagflow::testing::{RecordingHandler, ScriptedSession, TestHarness};
use dagflow::{
    CheckpointError, CheckpointStore, EventBus, FileCheckpointStore, InMemoryCheckpointStore,
    Orchestrator, OrchestratorError, RunId, RunOptions, RunRecord, RunStatus, RunSummary,
    SessionRegistry, TaskId, TaskResult, TaskStatus, Workflow,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn orchestrator(store: Arc<dyn CheckpointStore>, session: Arc<ScriptedSession>) -> Orchestrator {
    let sessions = SessionRegistry::new(session.clone()).with_external(session);
    Orchestrator::new(store, Arc::new(EventBus::new()))
        .with_sessions(sessions)
        .with_cancel_poll_interval(Duration::from_millis(10))
}

async fn with_recorder(
    store: Arc<dyn CheckpointStore>,
    session: Arc<ScriptedSession>,
) -> (Orchestrator, Arc<RecordingHandler>) {
    let recorder = Arc::new(RecordingHandler::new());
    let events = Arc::new(EventBus::new());
    events.register(recorder.clone()).await;
    let sessions = SessionRegistry::new(session.clone()).with_external(session);
    let orchestrator = Orchestrator::new(store, events)
        .with_sessions(sessions)
        .with_cancel_poll_interval(Duration::from_millis(10));
    (orchestrator, recorder)
}

fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::new(*n)).collect()
}

/// Test: resuming a failed run skips completed tasks and runs the rest once.
#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let workflow = pipeline();
    let run_id = RunId::new("pipeline-1");

    let failing = Arc::new(ScriptedSession::new().fail_always("load", 1));
    let first = orchestrator(store.clone(), failing);
    let report = first
        .run(&workflow, RunOptions::new().with_run_id(run_id.clone()))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.completed, ids(&["extract", "transform"]));
    assert_eq!(report.failed, ids(&["load"]));
    assert_eq!(
        store.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );

    let healthy = Arc::new(ScriptedSession::new());
    let (second, recorder) = with_recorder(store.clone(), healthy.clone()).await;
    let report = second.resume(&workflow, &run_id, None).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped, ids(&["extract", "transform"]));
    assert_eq!(report.completed, ids(&["load"]));
    assert_eq!(healthy.invocations(), ids(&["load"]));
    assert!(recorder.kinds_for("extract").await.is_empty());

    let completed = store.load_completed(&run_id).await.unwrap();
    let expected: HashSet<TaskId> = ids(&["extract", "transform", "load"]).into_iter().collect();
    assert_eq!(completed, expected);
}

/// Test: resuming a completed run does nothing.
#[tokio::test]
async fn test_resume_completed_run_is_noop() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let workflow = diamond();

    let first = harness.execute_and_assert_success(&workflow).await;
    let run_id = first.report.run_id.clone();
    harness.session().reset_invocations();
    let events_before = harness.recorder().events().await.len();

    let again = harness
        .run(&workflow, RunOptions::resume(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(again.report.status, RunStatus::Completed);
    assert_eq!(again.report.skipped, ids(&["a", "b", "c", "d"]));
    assert!(again.report.completed.is_empty());
    assert_eq!(harness.session().total_invocations(), 0);
    assert_eq!(harness.recorder().events().await.len(), events_before);
}

/// Test: `from_task` re-runs the task and everything downstream of it.
#[tokio::test]
async fn test_resume_from_task_reruns_downstream() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let workflow = pipeline();

    let first = harness.execute_and_assert_success(&workflow).await;
    let run_id = first.report.run_id.clone();
    harness.session().reset_invocations();

    let report = harness
        .orchestrator()
        .resume(&workflow, &run_id, Some(TaskId::new("transform")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped, ids(&["extract"]));
    assert_eq!(report.completed, ids(&["transform", "load"]));
    assert_eq!(harness.session().invocations(), ids(&["transform", "load"]));
}

/// Test: a run left `running` by a crashed process resumes from its results.
#[tokio::test]
async fn test_resume_after_crash() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let store = harness.checkpoint();
    let workflow = diamond();
    let run_id = RunId::new("crashed");

    store.init_run(&run_id, workflow.name()).await.unwrap();
    store
        .update_run_status(&run_id, RunStatus::Running, RunSummary::default())
        .await
        .unwrap();
    for task in ["a", "b"] {
        store
            .record_task_result(
                &run_id,
                TaskResult::finished(TaskId::new(task), TaskStatus::Success, 1),
            )
            .await
            .unwrap();
    }
    // `c` was in flight when the process died.
    store
        .record_task_result(&run_id, TaskResult::running(TaskId::new("c"), 1))
        .await
        .unwrap();

    let result = harness
        .run(&workflow, RunOptions::resume(run_id.clone()))
        .await
        .unwrap();

    assert!(result.report.is_success());
    assert_eq!(result.report.skipped, ids(&["a", "b"]));
    assert_eq!(harness.session().invocations(), ids(&["c", "d"]));
    assert_eq!(
        store.get_run(&run_id).await.unwrap().status,
        RunStatus::Completed
    );
}

/// Test: resuming with a different workflow is rejected.
#[tokio::test]
async fn test_resume_with_other_workflow_is_rejected() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let first = harness.execute(&diamond()).await;

    let err = harness
        .run(&pipeline(), RunOptions::resume(first.report.run_id.clone()))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, OrchestratorError::WorkflowMismatch { .. }));
}

/// Test: resuming an unknown run is an error.
#[tokio::test]
async fn test_resume_unknown_run() {
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let err = harness
        .run(&diamond(), RunOptions::resume("missing"))
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::NotFound(_))
    ));
    assert_eq!(harness.session().total_invocations(), 0);
}

/// Test: a fresh run cannot take the id of an unfinished run unless forced.
#[tokio::test]
async fn test_duplicate_run_and_force() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let store = harness.checkpoint();
    let workflow = diamond();
    let run_id = RunId::new("busy");

    store.init_run(&run_id, workflow.name()).await.unwrap();
    store
        .update_run_status(&run_id, RunStatus::Running, RunSummary::default())
        .await
        .unwrap();
    store
        .record_task_result(
            &run_id,
            TaskResult::finished(TaskId::new("a"), TaskStatus::Success, 1),
        )
        .await
        .unwrap();

    let err = harness
        .run(&workflow, RunOptions::new().with_run_id(run_id.clone()))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::DuplicateRun(_))
    ));
    assert_eq!(harness.session().total_invocations(), 0);

    let forced = harness
        .run(
            &workflow,
            RunOptions::new().with_run_id(run_id.clone()).with_force(true),
        )
        .await
        .unwrap();

    assert!(forced.report.is_success());
    assert!(forced.report.skipped.is_empty());
    assert_eq!(harness.session().total_invocations(), 4);
}

/// Test: a finished run id can be reused for a fresh run.
#[tokio::test]
async fn test_fresh_run_replaces_finished_run() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let workflow = pipeline();
    let options = || RunOptions::new().with_run_id("nightly");

    harness.run(&workflow, options()).await.unwrap();
    let second = harness.run(&workflow, options()).await.unwrap();

    assert!(second.report.is_success());
    assert_eq!(second.report.completed.len(), 3);
    assert_eq!(harness.session().total_invocations(), 6);
    assert_eq!(harness.checkpoint().list_runs().await.unwrap().len(), 1);
}

/// Test: checkpoints written by one store instance drive a resume in another.
#[tokio::test]
async fn test_file_store_resume_across_instances() {
    let dir = TempDir::new().unwrap();
    let workflow = diamond();
    let run_id = RunId::new("durable");

    {
        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
        let session = Arc::new(ScriptedSession::new().fail_always("c", 2));
        let orchestrator = orchestrator(store, session);
        let report = orchestrator
            .run(&workflow, RunOptions::new().with_run_id(run_id.clone()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed, ids(&["c"]));
        assert_eq!(report.blocked, ids(&["d"]));
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let record = store.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);

    let session = Arc::new(ScriptedSession::new());
    let orchestrator = orchestrator(store.clone(), session.clone());
    let report = orchestrator.resume(&workflow, &run_id, None).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.skipped, ids(&["a", "b"]));
    assert_eq!(session.invocations(), ids(&["c", "d"]));
}

/// Store that refuses to persist the terminal result of one task.
struct RejectingStore {
    inner: InMemoryCheckpointStore,
    reject: TaskId,
}

#[async_trait]
impl CheckpointStore for RejectingStore {
    async fn init_run(
        &self,
        run_id: &RunId,
        workflow_name: &str,
    ) -> Result<RunRecord, CheckpointError> {
        self.inner.init_run(run_id, workflow_name).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        self.inner.list_runs().await
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> Result<RunRecord, CheckpointError> {
        self.inner.update_run_status(run_id, status, summary).await
    }

    async fn reopen_run(&self, run_id: &RunId) -> Result<RunRecord, CheckpointError> {
        self.inner.reopen_run(run_id).await
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        self.inner.delete_run(run_id).await
    }

    async fn record_task_result(
        &self,
        run_id: &RunId,
        result: TaskResult,
    ) -> Result<(), CheckpointError> {
        if result.task_id == self.reject && result.status != TaskStatus::Running {
            return Err(CheckpointError::Other("disk full".into()));
        }
        self.inner.record_task_result(run_id, result).await
    }

    async fn load_completed(&self, run_id: &RunId) -> Result<HashSet<TaskId>, CheckpointError> {
        self.inner.load_completed(run_id).await
    }

    async fn list_task_results(&self, run_id: &RunId) -> Result<Vec<TaskResult>, CheckpointError> {
        self.inner.list_task_results(run_id).await
    }

    async fn invalidate_tasks(
        &self,
        run_id: &RunId,
        tasks: &[TaskId],
    ) -> Result<(), CheckpointError> {
        self.inner.invalidate_tasks(run_id, tasks).await
    }

    async fn append_attempt_log(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        attempt: u32,
        content: &str,
    ) -> Result<(), CheckpointError> {
        self.inner
            .append_attempt_log(run_id, task_id, attempt, content)
            .await
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        self.inner.request_cancel(run_id).await
    }

    async fn cancel_requested(&self, run_id: &RunId) -> Result<bool, CheckpointError> {
        self.inner.cancel_requested(run_id).await
    }
}

/// Test: a task whose result cannot be persisted does not count as complete.
#[tokio::test]
async fn test_unpersisted_result_is_not_completed() {
    let store: Arc<dyn CheckpointStore> = Arc::new(RejectingStore {
        inner: InMemoryCheckpointStore::new(),
        reject: TaskId::new("transform"),
    });
    let session = Arc::new(ScriptedSession::new());
    let (orchestrator, recorder) = with_recorder(store.clone(), session.clone()).await;

    let workflow = pipeline();
    let report = orchestrator.run(&workflow, RunOptions::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.completed, ids(&["extract"]));
    assert_eq!(report.failed, ids(&["transform"]));
    assert_eq!(report.blocked, ids(&["load"]));
    assert_eq!(session.invocation_count("load"), 0);
    assert_eq!(
        recorder.kinds_for("transform").await,
        vec!["TASK_START", "TASK_FAILED"]
    );

    let completed = store.load_completed(&report.run_id).await.unwrap();
    assert!(!completed.contains(&TaskId::new("transform")));
}

/// Test: workflows with no tasks complete immediately.
#[tokio::test]
async fn test_empty_workflow_completes() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let workflow = Workflow::new("empty", Vec::new()).unwrap();

    let result = harness.execute_and_assert_success(&workflow).await;

    assert!(result.report.completed.is_empty());
    assert_eq!(
        harness.recorder().kinds().await,
        vec!["WORKFLOW_START", "WORKFLOW_COMPLETE"]
    );
}
