//! dagflow - a DAG task-workflow engine.
//!
//! Workflows are declared as tasks with `depends_on` edges and optional
//! `on_success` / `on_failure` routes. The engine validates the graph, runs
//! ready tasks in parallel up to a bound, retries failures, checkpoints every
//! result so an interrupted run can resume, and writes lifecycle events to an
//! append-only stream.

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod session;
pub mod testing;

pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RunRecord,
    RunStatus, RunSummary, TaskResult, TaskStatus, open_store,
};
#[cfg(feature = "sqlite")]
pub use checkpoint::SqliteCheckpointStore;
pub use config::{ConfigError, EngineConfig, StorageConfig, YamlLoader, load_workflow, parse_workflow};
pub use core::environment::Environment;
pub use core::graph::{Edge, EdgeKind, Graph, GraphError};
pub use core::retry::RetryPolicy;
pub use core::task::{SessionTarget, TaskError, TaskSpec, TaskSpecBuilder};
pub use core::types::{RunId, TaskId};
pub use core::workflow::Workflow;
pub use events::{
    AppendLog, Event, EventBus, EventHandler, EventStreamWriter, FileAppendLog, MemoryAppendLog,
    SinkError,
};
pub use execution::{
    Orchestrator, OrchestratorError, RunOptions, RunReport, TaskOutcome, TaskRunner,
};
pub use session::{
    CommandOutput, Dispatch, LocalSession, Session, SessionError, SessionRegistry, SessionRequest,
    TmuxSession,
};
