//! Command execution boundary.
//!
//! The runner only cares whether a command succeeded and what it printed.

use crate::model::CommandSpec;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;

/// A command that exited non-zero, died from a signal, or never started.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub status: Option<i32>,
    /// Combined stdout and stderr captured before the failure.
    pub output: String,
    pub spawn_error: Option<String>,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.spawn_error, self.status) {
            (Some(e), _) => write!(f, "failed to spawn: {e}"),
            (None, Some(code)) => write!(f, "exited with status {code}"),
            (None, None) => f.write_str("terminated by signal"),
        }
    }
}

impl std::error::Error for CommandFailure {}

#[cfg(test)]
impl CommandFailure {
    pub fn exit(status: i32, output: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            output: output.into(),
            spawn_error: None,
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` to completion, returning its combined output.
    async fn execute(&self, command: &CommandSpec) -> Result<String, CommandFailure>;
}

/// Spawns real processes. Extra environment variables are applied on top of
/// the inherited environment, which is how the CLI is pointed at a daemon.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    env: Vec<(String, String)>,
}

impl ProcessExecutor {
    pub fn new(env: Vec<(String, String)>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, command: &CommandSpec) -> Result<String, CommandFailure> {
        let output = Command::new(&command.program)
            .args(&command.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CommandFailure {
                status: None,
                output: String::new(),
                spawn_error: Some(e.to_string()),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandFailure {
                status: output.status.code(),
                output: combined,
                spawn_error: None,
            })
        }
    }
}
