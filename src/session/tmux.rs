//! Fire-and-forget injection into tmux panes.
//!
//! The command is typed into the target pane with `send-keys`. Nothing waits
//! for it to finish, so success only means the hand-off happened.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::core::environment::Environment;
use crate::core::task::SessionTarget;

use super::{Dispatch, Session, SessionError, SessionRequest};

/// Injects commands into existing tmux sessions.
#[derive(Debug, Clone)]
pub struct TmuxSession {
    program: String,
}

impl TmuxSession {
    pub fn new() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }

    /// Use a specific tmux binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `tmux has-session -t <session>`, using the session part of a
    /// `session:window.pane` target.
    pub fn has_session_args(target: &str) -> Vec<String> {
        let session = target.split(':').next().unwrap_or(target);
        vec!["has-session".into(), "-t".into(), session.to_string()]
    }

    /// `tmux send-keys -t <target> -l <line>`: the line is typed literally,
    /// even when it looks like a key name such as `C-c`.
    pub fn send_keys_args(target: &str, line: &str) -> Vec<String> {
        vec![
            "send-keys".into(),
            "-t".into(),
            target.to_string(),
            "-l".into(),
            line.to_string(),
        ]
    }

    /// `tmux send-keys -t <target> Enter`
    pub fn enter_args(target: &str) -> Vec<String> {
        vec![
            "send-keys".into(),
            "-t".into(),
            target.to_string(),
            "Enter".into(),
        ]
    }

    /// The shell line typed into the pane: exports first, then the command.
    pub fn injected_line(command: &str, env: &Environment) -> Result<String, SessionError> {
        let mut exports = Vec::with_capacity(env.len());
        for (key, value) in env.iter() {
            if !is_env_name(key) {
                return Err(SessionError::InvalidEnvKey(key.clone()));
            }
            exports.push(format!("export {}={};", key, shell_escape(value)));
        }
        if exports.is_empty() {
            Ok(command.to_string())
        } else {
            Ok(format!("{} {}", exports.join(" "), command))
        }
    }

    async fn tmux(&self, args: &[String]) -> Result<std::process::Output, SessionError> {
        Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SessionError::Spawn(format!("{}: {}", self.program, e)))
    }
}

impl Default for TmuxSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for TmuxSession {
    fn name(&self) -> &str {
        "tmux"
    }

    async fn dispatch(&self, request: &SessionRequest) -> Result<Dispatch, SessionError> {
        let target = match &request.target {
            SessionTarget::Named(name) => name.as_str(),
            SessionTarget::Local => {
                return Err(SessionError::Spawn(
                    "tmux adapter needs a named session".into(),
                ));
            }
        };

        let has_session = self
            .tmux(&Self::has_session_args(target))
            .await
            .map_err(|_| SessionError::Unavailable(target.to_string()))?;
        if !has_session.status.success() {
            return Err(SessionError::Unavailable(target.to_string()));
        }

        let line = Self::injected_line(&request.command, &request.env)?;
        debug!(task = %request.task_id, target, "injecting command via send-keys");

        for args in [Self::send_keys_args(target, &line), Self::enter_args(target)] {
            let sent = self.tmux(&args).await?;
            if !sent.status.success() {
                return Err(SessionError::Spawn(
                    String::from_utf8_lossy(&sent.stderr).trim().to_string(),
                ));
            }
        }

        Ok(Dispatch::Injected {
            target: target.to_string(),
        })
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote a string for a POSIX shell unless it is made of safe characters.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
