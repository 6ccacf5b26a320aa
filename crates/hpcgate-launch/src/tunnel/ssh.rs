//! `ssh -N` forwarding processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::error::{LaunchError, LaunchResult};
use crate::tunnel::{ForwardPlan, TunnelLauncher, TunnelProcess};

/// Launches the system `ssh` client in the foreground as an owned child.
#[derive(Debug, Clone)]
pub struct SshTunnelLauncher {
    ssh_binary: PathBuf,
    grace: Duration,
}

impl SshTunnelLauncher {
    /// Use `ssh` from `PATH`; a process still running after `grace` counts as up.
    pub fn new(grace: Duration) -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            grace,
        }
    }

    pub fn with_binary(mut self, ssh_binary: impl Into<PathBuf>) -> Self {
        self.ssh_binary = ssh_binary.into();
        self
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn launch(&self, plan: &ForwardPlan) -> LaunchResult<Box<dyn TunnelProcess>> {
        let mut child = Command::new(&self.ssh_binary)
            .args(plan.ssh_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LaunchError::TunnelError(format!(
                    "failed to start {}: {e}",
                    self.ssh_binary.display()
                ))
            })?;
        let stderr = child.stderr.take();

        match tokio::time::timeout(self.grace, child.wait()).await {
            // Still running after the grace period.
            Err(_) => {
                if let Some(stderr) = stderr {
                    tokio::spawn(log_stderr(stderr, plan.target_node.clone()));
                }
                Ok(Box::new(SshTunnelProcess { child }))
            }
            Ok(Ok(status)) => {
                let mut message = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut message).await;
                }
                Err(LaunchError::TunnelError(format!(
                    "ssh tunnel to {} exited during startup ({status}): {}",
                    plan.target_node,
                    message.trim()
                )))
            }
            Ok(Err(e)) => Err(LaunchError::TunnelError(format!(
                "lost ssh tunnel process to {}: {e}",
                plan.target_node
            ))),
        }
    }
}

/// Forward ssh diagnostics to the log until the process exits.
async fn log_stderr(stderr: ChildStderr, node: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(node = %node, "ssh tunnel: {line}");
    }
}

/// A running `ssh -N` child. Killed when dropped.
#[derive(Debug)]
pub struct SshTunnelProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for SshTunnelProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self) -> LaunchResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| LaunchError::TunnelError(format!("failed to stop ssh tunnel: {e}")))
    }
}
