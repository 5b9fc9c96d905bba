//! Cooperative cancellation tests.
//!
//! Cancellation stops new dispatches; tasks already in flight run to their
//! natural end and the run finishes `cancelled`.

use crate::common::{diamond, wait_for_run_status};
use dagflow::testing::{ScriptedSession, TestHarness};
use dagflow::{
    CheckpointError, CheckpointStore, EventBus, InMemoryCheckpointStore, Orchestrator,
    OrchestratorError, RunId, RunOptions, RunStatus, SessionRegistry, TaskId,
};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(store: Arc<dyn CheckpointStore>, session: Arc<ScriptedSession>) -> Orchestrator {
    let sessions = SessionRegistry::new(session.clone()).with_external(session);
    Orchestrator::new(store, Arc::new(EventBus::new()))
        .with_sessions(sessions)
        .with_cancel_poll_interval(Duration::from_millis(10))
}

/// Test: cancelling the token lets the running task finish and starts nothing else.
#[tokio::test]
async fn test_token_cancel_stops_dispatch() {
    let session = ScriptedSession::new().with_task_delay("a", Duration::from_millis(300));
    let harness = TestHarness::new(session).await;
    let token = harness.orchestrator().cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let result = harness
        .run(&diamond(), RunOptions::new().with_run_id("cancel-me"))
        .await
        .unwrap();

    assert_eq!(result.report.status, RunStatus::Cancelled);
    assert_eq!(result.report.completed, vec![TaskId::new("a")]);
    assert_eq!(harness.session().invocations(), vec![TaskId::new("a")]);
    assert_eq!(
        harness.recorder().kinds().await,
        vec![
            "WORKFLOW_START",
            "TASK_START",
            "TASK_COMPLETE",
            "WORKFLOW_CANCEL"
        ]
    );

    let record = harness
        .checkpoint()
        .get_run(&RunId::new("cancel-me"))
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
}

/// Test: a cancellation request written to the store by another process is honoured.
#[tokio::test]
async fn test_cancel_through_store() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let session = Arc::new(ScriptedSession::new().with_task_delay("a", Duration::from_millis(300)));
    let runner = Arc::new(orchestrator(store.clone(), session.clone()));
    let run_id = RunId::new("remote");

    let handle = {
        let runner = Arc::clone(&runner);
        let options = RunOptions::new().with_run_id(run_id.clone());
        tokio::spawn(async move { runner.run(&diamond(), options).await })
    };

    wait_for_run_status(
        store.as_ref(),
        &run_id,
        RunStatus::Running,
        Duration::from_secs(5),
    )
    .await;

    let other = orchestrator(store.clone(), Arc::new(ScriptedSession::new()));
    other.request_cancel(&run_id).await.unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    for task in ["b", "c", "d"] {
        assert_eq!(session.invocation_count(task), 0, "{} should not run", task);
    }
    assert_eq!(
        store.get_run(&run_id).await.unwrap().status,
        RunStatus::Cancelled
    );
}

/// Test: a finished run cannot be cancelled.
#[tokio::test]
async fn test_cancel_finished_run_is_rejected() {
    let harness = TestHarness::new(ScriptedSession::new()).await;
    let result = harness.execute_and_assert_success(&diamond()).await;

    let err = harness
        .orchestrator()
        .request_cancel(&result.report.run_id)
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::InvalidTransition {
            from: RunStatus::Completed,
            to: RunStatus::Cancelled,
            ..
        })
    ));
}

/// Test: cancelling an unknown run reports it missing.
#[tokio::test]
async fn test_cancel_unknown_run() {
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let err = harness
        .orchestrator()
        .request_cancel(&RunId::new("ghost"))
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::NotFound(_))
    ));
}

/// Test: a cancelled run resumes where it stopped.
#[tokio::test]
async fn test_resume_after_cancel() {
    let session = ScriptedSession::new().with_task_delay("a", Duration::from_millis(200));
    let harness = TestHarness::new(session).await;
    let token = harness.orchestrator().cancellation_token();
    let run_id = RunId::new("interrupted");
    token.cancel();

    let cancelled = harness
        .run(&diamond(), RunOptions::new().with_run_id(run_id.clone()))
        .await
        .unwrap();
    assert_eq!(cancelled.report.status, RunStatus::Cancelled);
    assert_eq!(harness.session().total_invocations(), 0);

    let session = Arc::new(ScriptedSession::new());
    let resumed = orchestrator(harness.checkpoint(), session.clone())
        .resume(&diamond(), &run_id, None)
        .await
        .unwrap();

    assert!(resumed.is_success());
    assert_eq!(resumed.completed.len(), 4);
    assert_eq!(session.total_invocations(), 4);
}

/// Test: a stale cancellation request does not leak into the resumed run.
#[tokio::test]
async fn test_resume_clears_cancel_request() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let run_id = RunId::new("stale");
    store.init_run(&run_id, "diamond").await.unwrap();
    store.request_cancel(&run_id).await.unwrap();

    let session = Arc::new(ScriptedSession::new());
    let report = orchestrator(store.clone(), session.clone())
        .run(&diamond(), RunOptions::resume(run_id.clone()))
        .await
        .unwrap();

    // The request was made before the run started, so it still applies.
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(session.total_invocations(), 0);

    let report = orchestrator(store.clone(), session.clone())
        .resume(&diamond(), &run_id, None)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(session.total_invocations(), 4);
}
