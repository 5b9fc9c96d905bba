//! `on_success` / `on_failure` routing tests.

use dagflow::testing::{ScriptedSession, TestHarness};
use dagflow::{
    EngineConfig, Event, GraphError, OrchestratorError, RunStatus, TaskId, TaskSpec, Workflow,
    parse_workflow,
};
use std::time::Duration;

const RELEASE_YAML: &str = r#"
name: release
tasks:
  - id: build
    command: make build
    retries: 1
    on_success: deploy
    on_failure: rollback
  - id: deploy
    command: make deploy
  - id: rollback
    command: make rollback
"#;

fn release() -> Workflow {
    parse_workflow(RELEASE_YAML, &EngineConfig::default()).unwrap()
}

fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::new(*n)).collect()
}

fn completion_index(events: &[Event], task: &str) -> usize {
    events
        .iter()
        .position(|e| e.kind() == "TASK_COMPLETE" && e.task_id().is_some_and(|id| id.as_str() == task))
        .unwrap_or_else(|| panic!("no completion for {}", task))
}

/// Test: success takes the `on_success` route and leaves the failure route idle.
#[tokio::test]
async fn test_success_route() {
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let result = harness.execute_and_assert_success(&release()).await;

    assert_eq!(result.report.completed, ids(&["build", "deploy"]));
    assert_eq!(result.report.not_triggered, ids(&["rollback"]));
    assert_eq!(harness.session().invocation_count("rollback"), 0);
    assert!(harness.recorder().kinds_for("rollback").await.is_empty());
}

/// Test: a failure with an `on_failure` route is handled and the run completes.
#[tokio::test]
async fn test_failure_route_handles_failure() {
    let harness = TestHarness::new(ScriptedSession::new().fail_always("build", 2)).await;

    let result = harness.execute_and_assert_success(&release()).await;

    assert_eq!(result.report.status, RunStatus::Completed);
    assert_eq!(result.report.failed, ids(&["build"]));
    assert_eq!(result.report.handled, ids(&["build"]));
    assert_eq!(result.report.completed, ids(&["rollback"]));
    assert_eq!(result.report.not_triggered, ids(&["deploy"]));

    // The route fires only after retries are exhausted.
    assert_eq!(harness.session().invocation_count("build"), 2);
    assert_eq!(harness.session().invocation_count("rollback"), 1);
    assert_eq!(
        harness.recorder().kinds_for("build").await,
        vec!["TASK_START", "TASK_RETRY", "TASK_FAILED"]
    );
}

/// Test: an unhandled failure fails the run; its success target never runs.
#[tokio::test]
async fn test_unhandled_failure_leaves_success_target_untriggered() {
    let workflow = Workflow::new(
        "publish",
        vec![
            TaskSpec::builder("build", "make").on_success("publish").build(),
            TaskSpec::builder("publish", "upload").build(),
        ],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().fail_always("build", 1)).await;

    let result = harness.execute_and_assert_failure(&workflow).await;

    assert_eq!(result.report.status, RunStatus::Failed);
    assert_eq!(result.report.failed, ids(&["build"]));
    assert!(result.report.handled.is_empty());
    assert_eq!(result.report.not_triggered, ids(&["publish"]));
    assert_eq!(harness.session().invocation_count("publish"), 0);
}

/// Test: a fired route makes its target due without waiting on hard dependencies.
#[tokio::test]
async fn test_route_does_not_wait_for_hard_dependencies() {
    let workflow = Workflow::new(
        "notify",
        vec![
            TaskSpec::builder("quick", "true").on_success("notify").build(),
            TaskSpec::builder("slow", "sleep").build(),
            TaskSpec::builder("notify", "mail").depends_on("slow").build(),
        ],
    )
    .unwrap();
    let session = ScriptedSession::new().with_task_delay("slow", Duration::from_millis(300));
    let harness = TestHarness::new(session).await;

    let result = harness.execute_and_assert_success(&workflow).await;

    assert_eq!(result.report.completed, ids(&["quick", "slow", "notify"]));
    assert!(completion_index(&result.events, "notify") < completion_index(&result.events, "slow"));
    assert_eq!(harness.session().invocation_count("notify"), 1);
}

/// Test: a route chain runs each target once.
#[tokio::test]
async fn test_route_chain() {
    let workflow = Workflow::new(
        "chain",
        vec![
            TaskSpec::builder("a", "a").on_success("b").build(),
            TaskSpec::builder("b", "b").on_failure("c").build(),
            TaskSpec::builder("c", "c").build(),
            TaskSpec::builder("d", "d").depends_on("a").build(),
        ],
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new().fail_always("b", 1)).await;

    let result = harness.execute_and_assert_success(&workflow).await;

    assert_eq!(result.report.completed, ids(&["a", "c", "d"]));
    assert_eq!(result.report.handled, ids(&["b"]));
    assert_eq!(harness.session().total_invocations(), 4);
}

/// Test: a route to an undeclared task is rejected before anything runs.
#[tokio::test]
async fn test_unknown_route_target_is_rejected() {
    let workflow = parse_workflow(
        r#"
name: broken
tasks:
  - id: build
    command: make
    on_failure: page-oncall
"#,
        &EngineConfig::default(),
    )
    .unwrap();
    let harness = TestHarness::new(ScriptedSession::new()).await;

    let err = harness
        .run(&workflow, Default::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        OrchestratorError::Graph(GraphError::UnknownRouteTarget { ref target, .. })
            if target.as_str() == "page-oncall"
    ));
    assert!(harness.recorder().events().await.is_empty());
    assert_eq!(harness.session().total_invocations(), 0);
}
