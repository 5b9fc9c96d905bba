//! Local shell execution.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, Dispatch, Session, SessionError, SessionRequest};

/// Runs commands through `sh -c` in the engine's own process tree.
#[derive(Debug, Clone)]
pub struct LocalSession {
    shell: String,
}

impl LocalSession {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different POSIX shell.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for LocalSession {
    fn name(&self) -> &str {
        "local"
    }

    async fn dispatch(&self, request: &SessionRequest) -> Result<Dispatch, SessionError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&request.command);

        for (key, value) in request.env.iter() {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A timed-out attempt drops this future; the child must die with it.
        cmd.kill_on_drop(true);

        debug!(task = %request.task_id, shell = %self.shell, "spawning local command");

        let output = cmd
            .output()
            .await
            .map_err(|e| SessionError::Spawn(format!("{}: {}", self.shell, e)))?;

        Ok(Dispatch::Completed(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }))
    }
}
