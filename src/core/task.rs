//! Task specification and task-level error types.
//!
//! A [`TaskSpec`] is the declarative unit of work in a workflow: an opaque
//! command, the session it runs in, its dependencies and its failure policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::environment::Environment;
use super::retry::RetryPolicy;
use super::types::TaskId;

/// Default per-attempt timeout when neither the task nor the workflow sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that end a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The command ran and exited non-zero.
    #[error("command exited with code {exit_code}")]
    CommandFailed { exit_code: i32 },

    /// The attempt exceeded its timeout and was killed.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The named external session does not exist.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// The command could not be started.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl TaskError {
    /// Whether another attempt could change the outcome.
    ///
    /// A missing session will not appear by retrying, so it fails fast.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::SessionUnavailable(_))
    }

    /// Exit code carried by the error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskError::CommandFailed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Where a task's command is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionTarget {
    /// The engine's own process, synchronously and bounded by the timeout.
    #[default]
    Local,
    /// A named external session the command is injected into.
    Named(String),
}

impl SessionTarget {
    /// Parse a session name; `local`, `current` and the empty string mean local.
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "" | "local" | "current" => SessionTarget::Local,
            other => SessionTarget::Named(other.to_string()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SessionTarget::Local)
    }
}

impl From<String> for SessionTarget {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<SessionTarget> for String {
    fn from(target: SessionTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTarget::Local => write!(f, "local"),
            SessionTarget::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Declarative description of one task in a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Opaque invocation payload, handed verbatim to the session.
    pub command: String,
    pub depends_on: Vec<TaskId>,
    pub session: SessionTarget,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub env: Environment,
    /// Task to route to once this task succeeds.
    pub on_success: Option<TaskId>,
    /// Task to route to once this task fails for good.
    pub on_failure: Option<TaskId>,
}

impl TaskSpec {
    /// Create a new builder for a task.
    pub fn builder(id: impl Into<TaskId>, command: impl Into<String>) -> TaskSpecBuilder {
        TaskSpecBuilder::new(id, command)
    }
}

/// Builder for creating [`TaskSpec`] instances.
#[derive(Debug, Clone)]
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    /// Create a new builder with the given id and command.
    pub fn new(id: impl Into<TaskId>, command: impl Into<String>) -> Self {
        Self {
            spec: TaskSpec {
                id: id.into(),
                command: command.into(),
                depends_on: Vec::new(),
                session: SessionTarget::Local,
                timeout: DEFAULT_TIMEOUT,
                retry: RetryPolicy::none(),
                env: Environment::new(),
                on_success: None,
                on_failure: None,
            },
        }
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.spec.depends_on.push(id.into());
        self
    }

    /// Add several dependencies.
    pub fn depends_on_all<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.spec.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn session(mut self, session: SessionTarget) -> Self {
        self.spec.session = session;
        self
    }

    /// Per-attempt timeout. Zero is rejected when the graph is validated.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    /// Set the number of immediate retries.
    pub fn retries(mut self, retries: u32) -> Self {
        self.spec.retry = RetryPolicy::immediate(retries);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry = policy;
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.set(key, value);
        self
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.spec.env = env;
        self
    }

    pub fn on_success(mut self, id: impl Into<TaskId>) -> Self {
        self.spec.on_success = Some(id.into());
        self
    }

    pub fn on_failure(mut self, id: impl Into<TaskId>) -> Self {
        self.spec.on_failure = Some(id.into());
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}
