//! Workflow definition: a named, validated task graph.

use super::graph::{Graph, GraphError};
use super::task::TaskSpec;
use super::types::TaskId;

/// A named collection of tasks with their edges.
///
/// Declaration order is kept for deterministic tie-breaks, but execution
/// order is always derived from the graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    version: Option<String>,
    graph: Graph,
    max_parallel: Option<usize>,
}

impl Workflow {
    /// Create a workflow from tasks in declaration order.
    pub fn new(
        name: impl Into<String>,
        tasks: impl IntoIterator<Item = TaskSpec>,
    ) -> Result<Self, GraphError> {
        Ok(Self {
            name: name.into(),
            version: None,
            graph: Graph::from_tasks(tasks)?,
            max_parallel: None,
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Limit concurrent tasks for this workflow below the engine bound.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.graph.get_task(id)
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Validate the underlying graph.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.graph.validate()
    }
}
