//! hpcgate: interactive processes on batch-scheduled compute nodes
//!
//! This crate launches a long-running process (typically a Jupyter kernel) as a
//! SLURM job on a remote cluster and makes its ports reachable on `127.0.0.1`,
//! while the caller only ever talks to local ports.
//!
//! # Overview
//!
//! A launch goes through these steps:
//! 1. **Pre-flight**: scheduler flags, login host, username and SSH agent are checked before any I/O
//! 2. **Submission**: a batch script is rendered and fed to `sbatch --parsable` over SSH
//! 3. **Polling**: `squeue` is scraped on a timer until the job runs on a node
//! 4. **Tunnelling**: one `ssh -N -L ...` session forwards every port to that node, exactly once
//! 5. **Teardown**: cancellation or a terminal state closes the tunnel and calls `scancel`
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`slurm`] | batch script rendering, output parsing, the SSH-backed adapter |
//! | [`transport`] | single-round-trip remote commands with hard timeouts |
//! | [`tunnel`] | port-forward processes and the once-per-job tunnel manager |
//! | [`orchestrator`] | the job state machine and its poll loop |
//! | [`ticker`] | timers for the poll loop, including a manually driven one |
//! | [`config`] | YAML + environment configuration |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hpcgate_launch::{
//!     ConnectionDescriptor, JobEvent, LaunchConfig, Orchestrator, SshExecutor, SshTunnelLauncher,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LaunchConfig::load(None)?;
//!     let launcher = SshTunnelLauncher::new(config.timing.tunnel_grace());
//!     let orchestrator =
//!         Orchestrator::new(config, Arc::new(SshExecutor::new()), Arc::new(launcher));
//!
//!     let spec = orchestrator
//!         .config()
//!         .job_spec(["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"])
//!         .with_connection(ConnectionDescriptor::from_file("kernel.json")?);
//!
//!     let mut job = orchestrator.submit(spec).await?;
//!     while let Some(event) = job.next_event().await {
//!         if let JobEvent::TunnelOpened { node, .. } = event {
//!             println!("kernel is running on {node}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod slurm;
pub mod ticker;
pub mod transport;
pub mod tunnel;

// Re-exports
pub use config::{ConfigError, LaunchConfig, LoggingConfig, SlurmSettings, TimingConfig};
pub use context::{LaunchContext, LaunchStats};
pub use error::{LaunchError, LaunchResult};
pub use job::{
    ConnectionDescriptor, DEFAULT_JOB_NAME, ForwardedPort, JUPYTER_PORT_NAMES, JobSnapshot,
    JobSpec, JobState, parse_flag_list,
};
pub use orchestrator::{JobEvent, JobHandle, Orchestrator};
pub use slurm::{PollOutcome, SlurmAdapter, generate_batch_script};
pub use ticker::{IntervalTicker, ManualTicker, TickDriver, Ticker};
pub use transport::{ExecOutput, RemoteCommand, RemoteExecutor, SshExecutor, SshRoute};
pub use tunnel::{
    ForwardPlan, SshTunnelLauncher, TunnelLauncher, TunnelManager, TunnelProcess, TunnelSession,
};

// Test doubles, enabled with the `testing` feature
#[cfg(any(test, feature = "testing"))]
pub use transport::{ScriptedExecutor, ScriptedReply};
#[cfg(any(test, feature = "testing"))]
pub use tunnel::MockTunnelLauncher;
