//! Task graph with tagged edges.
//!
//! `depends_on` entries become [`EdgeKind::Hard`] edges that order execution.
//! `on_success` / `on_failure` routes become soft edges: they never order
//! execution, they only decide whether their target is due at all.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use super::task::TaskSpec;
use super::types::TaskId;

/// Errors that can occur when validating a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The hard dependencies contain a cycle. Lists the tasks that could not
    /// be scheduled, in declaration order.
    #[error("cycle detected among tasks: {}", join_ids(.tasks))]
    CycleDetected { tasks: Vec<TaskId> },

    /// A `depends_on` entry does not name a declared task.
    #[error("unknown dependency: task '{task}' depends on undeclared task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    /// An `on_success` / `on_failure` route names an undeclared task.
    #[error("unknown route target: task '{task}' routes to undeclared task '{target}'")]
    UnknownRouteTarget { task: TaskId, target: TaskId },

    /// A task's timeout is zero, so every attempt would time out at once.
    #[error("task '{0}' has a zero timeout")]
    ZeroTimeout(TaskId),

    /// Two tasks share an id.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// Task not found in the graph.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Kind of edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// `to` may only run after `from` reached terminal-success.
    Hard,
    /// `to` becomes due when `from` succeeds.
    OnSuccess,
    /// `to` becomes due when `from` fails for good.
    OnFailure,
}

impl EdgeKind {
    pub fn is_soft(&self) -> bool {
        !matches!(self, EdgeKind::Hard)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Hard => "hard",
            EdgeKind::OnSuccess => "on_success",
            EdgeKind::OnFailure => "on_failure",
        };
        write!(f, "{}", s)
    }
}

/// A directed edge `from -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: EdgeKind,
}

/// Tasks of one workflow, kept in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    tasks: Vec<TaskSpec>,
    index: HashMap<TaskId, usize>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks in declaration order.
    ///
    /// Only duplicate ids are rejected here; references are checked by
    /// [`Graph::validate`].
    pub fn from_tasks(tasks: impl IntoIterator<Item = TaskSpec>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    /// Append a task.
    pub fn add_task(&mut self, task: TaskSpec) -> Result<(), GraphError> {
        if self.index.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id));
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check whether a task is declared.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Declaration position of a task.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Hard dependencies of a task.
    pub fn dependencies(&self, id: &TaskId) -> Option<&[TaskId]> {
        self.get_task(id).map(|t| t.depends_on.as_slice())
    }

    /// Tasks that hard-depend on the given task, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// All edges, hard and soft, in declaration order of their owning task.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for task in &self.tasks {
            for dep in &task.depends_on {
                edges.push(Edge {
                    from: dep.clone(),
                    to: task.id.clone(),
                    kind: EdgeKind::Hard,
                });
            }
            if let Some(target) = &task.on_success {
                edges.push(Edge {
                    from: task.id.clone(),
                    to: target.clone(),
                    kind: EdgeKind::OnSuccess,
                });
            }
            if let Some(target) = &task.on_failure {
                edges.push(Edge {
                    from: task.id.clone(),
                    to: target.clone(),
                    kind: EdgeKind::OnFailure,
                });
            }
        }
        edges
    }

    /// Whether the task is the target of any soft edge.
    ///
    /// Route-gated tasks only run when one of their incoming routes fires.
    pub fn is_route_gated(&self, id: &TaskId) -> bool {
        self.tasks
            .iter()
            .any(|t| t.on_success.as_ref() == Some(id) || t.on_failure.as_ref() == Some(id))
    }

    /// Tasks whose hard dependencies are all in `completed` and which are not
    /// yet completed themselves, in declaration order.
    ///
    /// An empty result while `completed` does not cover every task means the
    /// graph is blocked.
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| !completed.contains(&t.id))
            .filter(|t| t.depends_on.iter().all(|dep| completed.contains(dep)))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Check references and acyclicity.
    ///
    /// Unknown references are reported before cycles, in declaration order.
    pub fn validate(&self) -> Result<(), GraphError> {
        for task in &self.tasks {
            if task.timeout.is_zero() {
                return Err(GraphError::ZeroTimeout(task.id.clone()));
            }
            for dep in &task.depends_on {
                if !self.contains(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for target in task.on_success.iter().chain(task.on_failure.iter()) {
                if !self.contains(target) {
                    return Err(GraphError::UnknownRouteTarget {
                        task: task.id.clone(),
                        target: target.clone(),
                    });
                }
                if target == &task.id {
                    return Err(GraphError::CycleDetected {
                        tasks: vec![task.id.clone()],
                    });
                }
            }
        }

        self.layers()?;
        Ok(())
    }

    /// Readiness layers over hard edges (Kahn's algorithm).
    ///
    /// Tasks inside a layer have no ordering constraint between them and are
    /// listed in declaration order.
    pub fn layers(&self) -> Result<Vec<Vec<TaskId>>, GraphError> {
        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, task) in self.tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                if !seen.insert(dep) {
                    continue;
                }
                let j = self
                    .position(dep)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })?;
                in_degree[i] += 1;
                downstream[j].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut scheduled = 0;

        while !current.is_empty() {
            scheduled += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for &d in &downstream[i] {
                    in_degree[d] -= 1;
                    if in_degree[d] == 0 {
                        next.push(d);
                    }
                }
            }
            next.sort_unstable();
            layers.push(current.iter().map(|&i| self.tasks[i].id.clone()).collect());
            current = next;
        }

        if scheduled != n {
            let tasks = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.tasks[i].id.clone())
                .collect();
            return Err(GraphError::CycleDetected { tasks });
        }

        Ok(layers)
    }

    /// Validated total order, layer by layer.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        Ok(self.layers()?.into_iter().flatten().collect())
    }

    /// The task plus every task reachable from it over hard and soft edges,
    /// in declaration order.
    pub fn reachable_from(&self, id: &TaskId) -> Result<Vec<TaskId>, GraphError> {
        if !self.contains(id) {
            return Err(GraphError::TaskNotFound(id.clone()));
        }

        let mut adjacency: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.depends_on {
                adjacency.entry(dep).or_default().push(&task.id);
            }
            for target in task.on_success.iter().chain(task.on_failure.iter()) {
                adjacency.entry(&task.id).or_default().push(target);
            }
        }

        let visited = walk(id, |node| adjacency.get(node).cloned().unwrap_or_default());
        Ok(self.in_declaration_order(&visited))
    }

    /// The task plus its transitive hard dependencies, in declaration order.
    pub fn with_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, GraphError> {
        if !self.contains(id) {
            return Err(GraphError::TaskNotFound(id.clone()));
        }

        let visited = walk(id, |node| {
            self.dependencies(node)
                .map(|deps| deps.iter().collect())
                .unwrap_or_default()
        });
        Ok(self.in_declaration_order(&visited))
    }

    fn in_declaration_order(&self, ids: &HashSet<TaskId>) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| ids.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Breadth-first walk collecting every node reachable from `start`.
fn walk<'a, F>(start: &'a TaskId, mut next: F) -> HashSet<TaskId>
where
    F: FnMut(&'a TaskId) -> Vec<&'a TaskId>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node.clone()) {
            continue;
        }
        queue.extend(next(node));
    }
    visited
}
