//! Remote command execution over SSH.
//!
//! Every call is a single round trip bounded by a timeout. No shell state
//! survives between calls, so the same executor serves submission, polling
//! and cancellation.

#[cfg(any(test, feature = "testing"))]
mod mock;
mod route;
mod ssh;

#[cfg(any(test, feature = "testing"))]
pub use mock::{RecordedCall, ScriptedExecutor, ScriptedReply};
pub use route::{SshRoute, shell_escape};
pub use ssh::SshExecutor;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LaunchError, LaunchResult};

/// Exit status ssh itself uses for connection and authentication failures.
pub const SSH_TRANSPORT_EXIT: i32 = 255;

/// A command to run on the login host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Payload fed over the transport's input channel.
    pub stdin: Option<String>,
}

impl RemoteCommand {
    /// Create a command from an argument vector.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// Feed `input` to the command's standard input.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program name, used to label errors.
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// The argument vector as one shell-safe line.
    pub fn shell_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| shell_escape(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Classify the exit status.
    ///
    /// 255 is reported by ssh itself and maps to a transport failure; any other
    /// nonzero status is the remote command's own failure.
    pub fn into_result(self, command: &RemoteCommand) -> LaunchResult<Self> {
        match self.exit_code {
            0 => Ok(self),
            SSH_TRANSPORT_EXIT => Err(LaunchError::TransportError(format!(
                "ssh failed while running {}: {}",
                command.program(),
                self.stderr.trim()
            ))),
            exit_code => Err(LaunchError::RemoteCommandError {
                command: command.program().to_string(),
                exit_code,
                stderr: self.stderr.trim().to_string(),
            }),
        }
    }
}

/// Runs one command on the cluster's login host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through `route`, failing with `Timeout` after `timeout`.
    ///
    /// Nonzero exit statuses are returned as errors (see [`ExecOutput::into_result`]).
    async fn run(
        &self,
        route: &SshRoute,
        command: RemoteCommand,
        timeout: Duration,
    ) -> LaunchResult<ExecOutput>;
}
