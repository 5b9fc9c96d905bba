//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use dagflow::{CheckpointStore, RunId, RunRecord, RunStatus, TaskSpec, Workflow};
use std::time::Duration;

/// Wait for a run to reach an expected status, polling the checkpoint store.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Polls every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the run reaches the expected status.
pub async fn wait_for_run_status(
    store: &dyn CheckpointStore,
    run_id: &RunId,
    expected: RunStatus,
    timeout: Duration,
) -> RunRecord {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(run) = store.get_run(run_id).await {
            if run.status == expected {
                return run;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Timeout waiting for run {} to reach {}, current status: {}",
                    run_id, expected, run.status
                );
            }
        } else if start.elapsed() > timeout {
            panic!("Timeout waiting for run {} to appear", run_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `a`, then `b` and `c`, then `d`.
pub fn diamond() -> Workflow {
    Workflow::new(
        "diamond",
        vec![
            TaskSpec::builder("a", "echo a").build(),
            TaskSpec::builder("b", "echo b").depends_on("a").build(),
            TaskSpec::builder("c", "echo c").depends_on("a").build(),
            TaskSpec::builder("d", "echo d").depends_on_all(["b", "c"]).build(),
        ],
    )
    .unwrap()
}

/// `extract -> transform -> load`.
pub fn pipeline() -> Workflow {
    Workflow::new(
        "pipeline",
        vec![
            TaskSpec::builder("extract", "echo extract").build(),
            TaskSpec::builder("transform", "echo transform")
                .depends_on("extract")
                .build(),
            TaskSpec::builder("load", "echo load")
                .depends_on("transform")
                .build(),
        ],
    )
    .unwrap()
}

/// Position of a task in an invocation or event sequence.
pub fn position_of(ids: &[dagflow::TaskId], task: &str) -> usize {
    ids.iter()
        .position(|id| id.as_str() == task)
        .unwrap_or_else(|| panic!("task {} not found in {:?}", task, ids))
}
