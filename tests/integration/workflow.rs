//! Complete workflow integration tests.
//!
//! Tests that verify the full pipeline from workflow definition to execution.

use crate::common::{diamond, position_of};
use dagflow::testing::{ScriptedSession, TestHarness};
use dagflow::{
    CheckpointStore, EngineConfig, EventBus, EventStreamWriter, FileAppendLog,
    FileCheckpointStore, GraphError, MemoryAppendLog, Orchestrator, OrchestratorError, RunId,
    RunOptions, RunStatus, TaskId, TaskSpec, TaskStatus, Workflow, parse_workflow,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIAMOND_YAML: &str = r#"
name: diamond
version: 1
tasks:
  - id: A
    command: echo A
  - id: B
    command: echo B
    depends_on: [A]
  - id: C
    command: echo C
    depends_on: [A]
  - id: D
    command: echo D
    depends_on: [B, C]
"#;

/// Test: dependency order is respected and the run completes.
#[tokio::test]
async fn test_diamond_from_yaml_runs_in_dependency_order() {
    let workflow = parse_workflow(DIAMOND_YAML, &EngineConfig::default()).unwrap();
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let result = harness.execute_and_assert_success(&workflow).await;

    assert_eq!(result.report.status, RunStatus::Completed);
    let order = harness.session().invocations();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0].as_str(), "A");
    assert_eq!(order[3].as_str(), "D");

    // Every task's start precedes its completion.
    for task in ["A", "B", "C", "D"] {
        assert_eq!(
            harness.recorder().kinds_for(task).await,
            vec!["TASK_START", "TASK_COMPLETE"]
        );
    }

    let kinds = harness.recorder().kinds().await;
    assert_eq!(kinds.first(), Some(&"WORKFLOW_START"));
    assert_eq!(kinds.last(), Some(&"WORKFLOW_COMPLETE"));
}

/// Test: a task that always fails is attempted retries + 1 times.
#[tokio::test]
async fn test_retry_bound_then_failure() {
    let workflow = parse_workflow(
        r#"
name: flaky
tasks:
  - id: X
    command: "false"
    retries: 2
"#,
        &EngineConfig::default(),
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().fail_always("X", 1)).await;

    let result = harness.execute_and_assert_failure(&workflow).await;

    assert_eq!(result.report.status, RunStatus::Failed);
    assert_eq!(harness.session().invocation_count("X"), 3);

    let results = harness
        .store()
        .list_task_results(&result.report.run_id)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, TaskStatus::Failed);
    assert_eq!(results[0].attempt, 3);
    assert_eq!(results[0].exit_code, Some(1));

    assert_eq!(
        harness.recorder().kinds_for("X").await,
        vec!["TASK_START", "TASK_RETRY", "TASK_RETRY", "TASK_FAILED"]
    );

    let record = harness.store().get_run(&result.report.run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.tasks_failed, 1);
}

/// Test: a flaky task recovers within its retry budget.
#[tokio::test]
async fn test_retry_recovers() {
    let workflow = Workflow::new(
        "recovering",
        vec![TaskSpec::builder("net", "curl").retries(3).build()],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().fail_times("net", 2, 7)).await;

    let result = harness.execute_and_assert_success(&workflow).await;

    let results = harness
        .store()
        .list_task_results(&result.report.run_id)
        .await
        .unwrap();
    assert_eq!(results[0].status, TaskStatus::Success);
    assert_eq!(results[0].attempt, 3);
}

/// Test: an undeclared dependency is rejected before anything happens.
#[tokio::test]
async fn test_unknown_dependency_rejected_without_events() {
    let workflow = parse_workflow(
        r#"
name: broken
tasks:
  - id: X
    command: echo x
    depends_on: [Y]
"#,
        &EngineConfig::default(),
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let err = harness
        .run(&workflow, RunOptions::new())
        .await
        .err()
        .expect("workflow should be rejected");

    match err {
        OrchestratorError::Graph(GraphError::UnknownDependency { task, dependency }) => {
            assert_eq!(task.as_str(), "X");
            assert_eq!(dependency.as_str(), "Y");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(harness.recorder().events().await.is_empty());
    assert_eq!(harness.session().total_invocations(), 0);
}

/// Test: a cycle is rejected and nothing is dispatched.
#[tokio::test]
async fn test_cycle_rejected() {
    let workflow = Workflow::new(
        "loop",
        vec![
            TaskSpec::builder("a", "a").depends_on("c").build(),
            TaskSpec::builder("b", "b").depends_on("a").build(),
            TaskSpec::builder("c", "c").depends_on("b").build(),
            TaskSpec::builder("free", "free").build(),
        ],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let err = harness.run(&workflow, RunOptions::new()).await.err().unwrap();

    assert!(matches!(
        err,
        OrchestratorError::Graph(GraphError::CycleDetected { .. })
    ));
    assert_eq!(harness.session().total_invocations(), 0);
}

/// Test: dry run resolves every task without contacting a session.
#[tokio::test]
async fn test_dry_run_invokes_nothing() {
    let harness = TestHarness::new(ScriptedSession::new().fail_always("b", 1)).await;

    let result = harness
        .run(&diamond(), RunOptions::new().with_dry_run(true))
        .await
        .unwrap();

    assert_eq!(result.report.status, RunStatus::Completed);
    assert_eq!(harness.session().total_invocations(), 0);

    let results = harness
        .store()
        .list_task_results(&result.report.run_id)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.status == TaskStatus::DryRun));
}

/// Test: no more than the configured number of tasks run at once.
#[tokio::test]
async fn test_parallelism_bound() {
    let tasks: Vec<TaskSpec> = (0..8)
        .map(|i| TaskSpec::builder(format!("t{}", i), "work").build())
        .collect();
    let workflow = Workflow::new("wide", tasks).unwrap();
    let harness = TestHarness::new(ScriptedSession::new().with_delay(Duration::from_millis(30)))
        .await
        .with_max_parallel(3);

    harness.execute_and_assert_success(&workflow).await;

    assert_eq!(harness.session().total_invocations(), 8);
    assert!(harness.session().max_concurrency() <= 3);
    assert!(harness.session().max_concurrency() >= 2);
}

/// Test: the workflow's own bound applies when it is tighter.
#[tokio::test]
async fn test_workflow_parallelism_bound_is_respected() {
    let tasks: Vec<TaskSpec> = (0..4)
        .map(|i| TaskSpec::builder(format!("t{}", i), "work").build())
        .collect();
    let workflow = Workflow::new("serial", tasks).unwrap().with_max_parallel(1);
    let harness =
        TestHarness::new(ScriptedSession::new().with_delay(Duration::from_millis(10))).await;

    harness.execute_and_assert_success(&workflow).await;

    assert_eq!(harness.session().max_concurrency(), 1);
}

/// Test: independent branches keep running after a sibling fails.
#[tokio::test]
async fn test_partial_failure_keeps_siblings_running() {
    let workflow = Workflow::new(
        "branches",
        vec![
            TaskSpec::builder("left", "l").build(),
            TaskSpec::builder("left_child", "lc").depends_on("left").build(),
            TaskSpec::builder("right", "r").build(),
            TaskSpec::builder("right_child", "rc").depends_on("right").build(),
        ],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().fail_always("left", 2)).await;

    let result = harness.execute_and_assert_failure(&workflow).await;

    assert_eq!(result.report.failed, vec![TaskId::new("left")]);
    assert_eq!(result.report.blocked, vec![TaskId::new("left_child")]);
    assert_eq!(
        result.report.completed,
        vec![TaskId::new("right"), TaskId::new("right_child")]
    );
    assert_eq!(harness.session().invocation_count("left_child"), 0);
}

/// Test: injected tasks count as terminal-success.
#[tokio::test]
async fn test_injected_task_unblocks_dependents() {
    let workflow = parse_workflow(
        r#"
name: remote
tasks:
  - id: build
    command: make
    session: "builder:0"
  - id: report
    command: echo done
    depends_on: [build]
"#,
        &EngineConfig::default(),
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().inject("build")).await;

    let result = harness.execute_and_assert_success(&workflow).await;

    let results = harness
        .store()
        .list_task_results(&result.report.run_id)
        .await
        .unwrap();
    let build = results.iter().find(|r| r.task_id.as_str() == "build").unwrap();
    assert_eq!(build.status, TaskStatus::Injected);
    assert_eq!(build.exit_code, None);
}

/// Test: a missing session fails the task once, without retries.
#[tokio::test]
async fn test_missing_session_is_not_retried() {
    let workflow = Workflow::new(
        "gone",
        vec![TaskSpec::builder("ghost", "echo").retries(4).build()],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().unavailable("ghost")).await;

    let result = harness.execute_and_assert_failure(&workflow).await;

    assert_eq!(harness.session().invocation_count("ghost"), 1);
    assert_eq!(
        harness.recorder().kinds_for("ghost").await,
        vec!["TASK_START", "TASK_FAILED"]
    );
    assert_eq!(result.report.status, RunStatus::Failed);
}

/// Test: real shell commands with file-backed state and event stream.
#[tokio::test]
async fn test_local_commands_with_file_store() {
    let dir = TempDir::new().unwrap();
    let engine = EngineConfig {
        state_dir: dir.path().join("state"),
        ..EngineConfig::default()
    };
    let marker = dir.path().join("marker");
    let yaml = r#"
name: shell
env:
  GREETING: hello
tasks:
  - id: greet
    command: echo "$GREETING $TARGET"
    env:
      TARGET: world
  - id: fail_once
    command: 'test -f "$MARKER" || { touch "$MARKER"; exit 3; }'
    retries: 1
    depends_on: [greet]
    env:
      MARKER: MARKER_PATH
"#
    .replace("MARKER_PATH", &marker.display().to_string());
    let workflow = parse_workflow(&yaml, &engine).unwrap();

    let store = Arc::new(FileCheckpointStore::new(&engine.state_dir));
    let log_path = engine.event_log_path();
    let events = Arc::new(EventBus::new());
    events
        .register(Arc::new(EventStreamWriter::new(Arc::new(FileAppendLog::new(
            &log_path,
        )))))
        .await;

    let orchestrator = Orchestrator::from_config(&engine, store.clone(), events);
    let run_id = RunId::new("wf-shell");
    let report = orchestrator
        .run(&workflow, RunOptions::new().with_run_id(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(marker.exists());

    let greet_log = std::fs::read_to_string(store.attempt_log_path(
        &run_id,
        &TaskId::new("greet"),
        1,
    ))
    .unwrap();
    assert!(greet_log.contains("hello world"));
    assert!(
        store
            .attempt_log_path(&run_id, &TaskId::new("fail_once"), 2)
            .exists()
    );

    let lines: Vec<String> = std::fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    let kinds: Vec<&str> = lines
        .iter()
        .map(|l| l.split('|').nth(3).unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "WORKFLOW_START",
            "TASK_START",
            "TASK_COMPLETE",
            "TASK_START",
            "TASK_RETRY",
            "TASK_COMPLETE",
            "WORKFLOW_COMPLETE"
        ]
    );
    assert!(lines.iter().all(|l| l.contains("|dagflow:wf-shell|*|")));
}

/// Test: events reach an in-memory append log in order.
#[tokio::test]
async fn test_event_stream_to_memory_log() {
    let log = Arc::new(MemoryAppendLog::new());
    let events = Arc::new(EventBus::new());
    events
        .register(Arc::new(EventStreamWriter::new(log.clone())))
        .await;
    let store = Arc::new(dagflow::InMemoryCheckpointStore::new());
    let orchestrator = Orchestrator::new(store, events)
        .with_sessions(dagflow::SessionRegistry::new(Arc::new(ScriptedSession::new())));

    orchestrator
        .run(&diamond(), RunOptions::new().with_run_id("wf-stream"))
        .await
        .unwrap();

    let lines = log.lines();
    assert_eq!(lines.len(), 10);
    let tasks: Vec<TaskId> = lines
        .iter()
        .filter(|l| l.contains("|TASK_START|"))
        .filter_map(|l| l.split("task=").nth(1))
        .map(|rest| TaskId::new(rest.split(' ').next().unwrap_or_default()))
        .collect();
    assert!(position_of(&tasks, "a") < position_of(&tasks, "b"));
    assert!(position_of(&tasks, "c") < position_of(&tasks, "d"));
}
