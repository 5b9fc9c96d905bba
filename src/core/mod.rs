//! Core domain types: identifiers, task specs, the task graph and workflows.

pub mod environment;
pub mod graph;
pub mod retry;
pub mod task;
pub mod types;
pub mod workflow;
