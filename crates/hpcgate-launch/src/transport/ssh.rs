//! `ssh`-binary implementation of [`RemoteExecutor`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{LaunchError, LaunchResult};
use crate::transport::{ExecOutput, RemoteCommand, RemoteExecutor, SshRoute};

/// Runs commands through the system `ssh` client.
///
/// Commands are wrapped in `/bin/bash --login -c` so site profiles (modules,
/// scheduler paths) are loaded, the way an interactive user would see them.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_binary: PathBuf,
    login_shell: bool,
    extra_options: Vec<String>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            login_shell: true,
            extra_options: Vec::new(),
        }
    }
}

impl SshExecutor {
    /// Create an executor using `ssh` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific ssh binary.
    pub fn with_binary(mut self, ssh_binary: impl Into<PathBuf>) -> Self {
        self.ssh_binary = ssh_binary.into();
        self
    }

    /// Run the command directly instead of through a login shell.
    pub fn without_login_shell(mut self) -> Self {
        self.login_shell = false;
        self
    }

    /// Add a raw `-o` option, e.g. `ConnectTimeout=10`.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    /// Full ssh argument vector for `command` (without the binary).
    pub fn ssh_args(&self, route: &SshRoute, command: &RemoteCommand) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-A".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.extend(route.login_args());

        // ssh joins remote arguments with spaces and hands them to the remote
        // shell, so the command must already be a single quoted line.
        if self.login_shell {
            args.push("/bin/bash".to_string());
            args.push("--login".to_string());
            args.push("-c".to_string());
            args.push(super::shell_escape(&command.shell_line()));
        } else {
            args.push(command.shell_line());
        }
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        route: &SshRoute,
        command: RemoteCommand,
        timeout: Duration,
    ) -> LaunchResult<ExecOutput> {
        let args = self.ssh_args(route, &command);
        tracing::debug!(
            target_host = %route.describe(),
            command = %command.shell_line(),
            "Running remote command"
        );

        let mut child = Command::new(&self.ssh_binary)
            .args(&args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LaunchError::TransportError(format!(
                    "failed to start {}: {e}",
                    self.ssh_binary.display()
                ))
            })?;

        let stdin_payload = command.stdin.clone();
        let stdin_pipe = child.stdin.take();
        let round_trip = async move {
            if let (Some(mut pipe), Some(payload)) = (stdin_pipe, stdin_payload) {
                // A refused login closes stdin early; the exit status tells the real story.
                if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                    tracing::debug!(error = %e, "Remote side closed stdin early");
                }
                drop(pipe);
            }
            child.wait_with_output().await
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| {
                LaunchError::Timeout(format!(
                    "{} on {} timed out after {}s",
                    command.program(),
                    route.describe(),
                    timeout.as_secs_f32()
                ))
            })?
            .map_err(|e| {
                LaunchError::TransportError(format!(
                    "lost ssh session to {}: {e}",
                    route.describe()
                ))
            })?;

        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        tracing::debug!(
            exit_code = result.exit_code,
            stdout = %result.stdout.trim(),
            "Remote command finished"
        );

        result.into_result(&command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_login_shell() {
        let executor = SshExecutor::new();
        let route = SshRoute::new("login.cluster.edu", "alice");
        let command = RemoteCommand::new(["sbatch", "--parsable"]);

        let args = executor.ssh_args(&route, &command);
        assert_eq!(
            args,
            vec![
                "-T",
                "-A",
                "-o",
                "BatchMode=yes",
                "-l",
                "alice",
                "login.cluster.edu",
                "/bin/bash",
                "--login",
                "-c",
                "'sbatch --parsable'",
            ]
        );
    }

    #[test]
    fn test_ssh_args_nested_quoting() {
        let executor = SshExecutor::new().with_option("ConnectTimeout=10");
        let route = SshRoute::new("login", "alice").with_jump_host("gate");
        let command = RemoteCommand::new(["squeue", "-h", "-j", "7", "-o", "%T %B"]);

        let args = executor.ssh_args(&route, &command);
        assert_eq!(&args[4..6], &["-o", "ConnectTimeout=10"]);
        assert_eq!(&args[6..8], &["-J", "gate"]);
        assert_eq!(
            args.last().unwrap(),
            r#"'squeue -h -j 7 -o '\''%T %B'\'''"#
        );
    }

    #[test]
    fn test_ssh_args_without_login_shell() {
        let executor = SshExecutor::new().without_login_shell();
        let route = SshRoute::new("login", "alice");
        let command = RemoteCommand::new(["scancel", "42"]);
        let args = executor.ssh_args(&route, &command);
        assert_eq!(args.last().unwrap(), "scancel 42");
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let executor = SshExecutor::new().with_binary("/nonexistent/hpcgate-ssh");
        let route = SshRoute::new("login", "alice");
        let err = executor
            .run(&route, RemoteCommand::new(["true"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::TransportError(_)));
    }
}
