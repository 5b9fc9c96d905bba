//! Session adapters: where a task's command actually runs.
//!
//! A [`Session`] takes an opaque command and either runs it to completion
//! ([`Dispatch::Completed`]) or hands it off to an external target without
//! waiting ([`Dispatch::Injected`]). The runner owns timeouts and retries;
//! adapters only dispatch.

mod local;
mod tmux;

pub use local::LocalSession;
pub use tmux::{TmuxSession, shell_escape};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::environment::Environment;
use crate::core::task::SessionTarget;
use crate::core::types::TaskId;

/// Errors raised by session adapters.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The named session does not exist.
    #[error("session '{0}' is not available")]
    Unavailable(String),

    /// The command could not be started or handed off.
    #[error("failed to dispatch command: {0}")]
    Spawn(String),

    /// An environment variable name that a shell cannot export.
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One command hand-off to a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub task_id: TaskId,
    pub command: String,
    pub target: SessionTarget,
    pub env: Environment,
}

/// Captured output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The command ran and exited.
    Completed(CommandOutput),
    /// The command was handed to an external session. Its real outcome is
    /// unknown.
    Injected { target: String },
}

/// Something that can run a task's command.
#[async_trait]
pub trait Session: Send + Sync {
    /// Adapter name, used in logs.
    fn name(&self) -> &str;

    /// Run or hand off the command.
    ///
    /// Dropping the returned future must stop any child process it started.
    async fn dispatch(&self, request: &SessionRequest) -> Result<Dispatch, SessionError>;
}

/// Maps session targets to adapters.
///
/// `local` goes to the local adapter; named targets go to an explicitly
/// registered adapter first, then to the fallback for external sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    local: Arc<dyn Session>,
    named: HashMap<String, Arc<dyn Session>>,
    external: Option<Arc<dyn Session>>,
}

impl SessionRegistry {
    /// Registry with the given local adapter and no external fallback.
    pub fn new(local: Arc<dyn Session>) -> Self {
        Self {
            local,
            named: HashMap::new(),
            external: None,
        }
    }

    /// Register an adapter for one specific session name.
    pub fn with_named(mut self, name: impl Into<String>, session: Arc<dyn Session>) -> Self {
        self.named.insert(name.into(), session);
        self
    }

    /// Adapter used for any named session without a specific registration.
    pub fn with_external(mut self, session: Arc<dyn Session>) -> Self {
        self.external = Some(session);
        self
    }

    /// Resolve the adapter for a target.
    pub fn resolve(&self, target: &SessionTarget) -> Result<Arc<dyn Session>, SessionError> {
        match target {
            SessionTarget::Local => Ok(Arc::clone(&self.local)),
            SessionTarget::Named(name) => self
                .named
                .get(name)
                .or(self.external.as_ref())
                .cloned()
                .ok_or_else(|| SessionError::Unavailable(name.clone())),
        }
    }
}

impl Default for SessionRegistry {
    /// Local shell execution with tmux injection for named sessions.
    fn default() -> Self {
        Self::new(Arc::new(LocalSession::new())).with_external(Arc::new(TmuxSession::new()))
    }
}
