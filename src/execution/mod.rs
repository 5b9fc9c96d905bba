//! Task execution engine.
//!
//! This module provides the execution infrastructure: the task runner that
//! drives one task through its attempts and the orchestrator that drives a
//! whole workflow run.

mod orchestrator;
mod runner;

pub use orchestrator::{
    DEFAULT_CANCEL_POLL, DEFAULT_MAX_PARALLEL, Orchestrator, OrchestratorError, RunOptions,
    RunReport,
};
pub use runner::{TaskOutcome, TaskRunner};
