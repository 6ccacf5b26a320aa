//! Local port forwarding to the compute node.
//!
//! One `ssh -N` process per job forwards every named port of the connection
//! descriptor to `127.0.0.1` on the node, relayed through the jump host (if
//! any) and the login host.

#[cfg(any(test, feature = "testing"))]
mod mock;
mod ssh;

#[cfg(any(test, feature = "testing"))]
pub use mock::MockTunnelLauncher;
pub use ssh::{SshTunnelLauncher, SshTunnelProcess};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::LaunchContext;
use crate::error::LaunchResult;
use crate::job::ForwardedPort;
use crate::transport::SshRoute;

/// What to forward and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    pub route: SshRoute,
    pub target_node: String,
    pub ports: BTreeSet<ForwardedPort>,
}

impl ForwardPlan {
    pub fn new(route: SshRoute, target_node: impl Into<String>, ports: BTreeSet<ForwardedPort>) -> Self {
        Self {
            route,
            target_node: target_node.into(),
            ports,
        }
    }

    /// Relay hops, in order. Empty when the node is the login host itself.
    pub fn hops(&self) -> Vec<String> {
        self.route.hops_to(&self.target_node)
    }

    /// ssh arguments (without the binary) for the forwarding session.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-N",
            "-A",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ExitOnForwardFailure=yes",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let hops = self.hops();
        if !hops.is_empty() {
            args.push("-J".to_string());
            args.push(hops.join(","));
        }
        for forwarded in &self.ports {
            args.push("-L".to_string());
            args.push(format!("{0}:127.0.0.1:{0}", forwarded.port));
        }
        args.push("-l".to_string());
        args.push(self.route.username.clone());
        args.push(self.target_node.clone());
        args
    }
}

/// Starts forwarding processes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Start forwarding per `plan`.
    ///
    /// Returns only once the process has survived its startup grace period.
    async fn launch(&self, plan: &ForwardPlan) -> LaunchResult<Box<dyn TunnelProcess>>;
}

/// A running forwarding process, owned by its [`TunnelSession`].
#[async_trait]
pub trait TunnelProcess: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Terminate the process and reap it.
    async fn stop(&mut self) -> LaunchResult<()>;
}

/// A forwarding session for one job. Created at most once.
pub struct TunnelSession {
    pub plan: ForwardPlan,
    pub opened_at: DateTime<Utc>,
    process: Box<dyn TunnelProcess>,
}

impl TunnelSession {
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("plan", &self.plan)
            .field("opened_at", &self.opened_at)
            .field("pid", &self.process.pid())
            .finish()
    }
}

/// Opens the tunnel for one job at most once and closes it at most once.
pub struct TunnelManager {
    launcher: Arc<dyn TunnelLauncher>,
    context: Arc<LaunchContext>,
    session: Option<TunnelSession>,
    active: bool,
    closed: bool,
    attempts: u32,
    max_attempts: u32,
}

impl TunnelManager {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        context: Arc<LaunchContext>,
        max_attempts: u32,
    ) -> Self {
        Self {
            launcher,
            context,
            session: None,
            active: false,
            closed: false,
            attempts: 0,
            max_attempts,
        }
    }

    /// Whether the tunnel has been opened (and not closed since).
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Launch attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// No more attempts will be made.
    pub fn gave_up(&self) -> bool {
        !self.active && self.attempts >= self.max_attempts
    }

    pub fn session(&self) -> Option<&TunnelSession> {
        self.session.as_ref()
    }

    /// Whether the forwarding process is still running.
    pub fn process_alive(&mut self) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.process.is_alive())
    }

    /// Open the forward to `node`.
    ///
    /// Returns `Ok(false)` without doing anything when the tunnel is already
    /// active, was closed, or has used up its attempts.
    pub async fn open(
        &mut self,
        route: &SshRoute,
        node: &str,
        ports: BTreeSet<ForwardedPort>,
    ) -> LaunchResult<bool> {
        if self.active || self.closed || self.gave_up() {
            return Ok(false);
        }

        self.attempts += 1;
        let plan = ForwardPlan::new(route.clone(), node, ports);
        tracing::info!(
            node,
            hops = ?plan.hops(),
            ports = plan.ports.len(),
            attempt = self.attempts,
            "Opening SSH tunnel"
        );
        tracing::debug!(args = ?plan.ssh_args(), "Tunnel command");

        match self.launcher.launch(&plan).await {
            Ok(process) => {
                self.context.record_tunnel_open(true);
                tracing::info!(node, pid = ?process.pid(), "SSH tunnel is up");
                self.session = Some(TunnelSession {
                    plan,
                    opened_at: Utc::now(),
                    process,
                });
                self.active = true;
                Ok(true)
            }
            Err(err) => {
                self.context.record_tunnel_open(false);
                Err(err)
            }
        }
    }

    /// Stop the forwarding process. Later calls are no-ops.
    pub async fn close(&mut self) {
        self.closed = true;
        self.active = false;
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.process.stop().await {
                tracing::warn!(error = %err, "Failed to stop SSH tunnel");
            } else {
                tracing::info!(node = %session.plan.target_node, "SSH tunnel closed");
            }
        }
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("session", &self.session)
            .field("active", &self.active)
            .field("closed", &self.closed)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
