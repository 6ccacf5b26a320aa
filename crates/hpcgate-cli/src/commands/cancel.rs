//! Cancel command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use hpcgate_launch::{LaunchConfig, Orchestrator, SshExecutor, SshTunnelLauncher};

/// Execute the cancel command.
pub async fn execute(config: LaunchConfig, job_id: u64) -> Result<()> {
    let launcher = SshTunnelLauncher::new(config.timing.tunnel_grace());
    let orchestrator = Orchestrator::new(config, Arc::new(SshExecutor::new()), Arc::new(launcher));

    orchestrator
        .cancel_remote(job_id)
        .await
        .with_context(|| format!("Failed to cancel job {job_id}"))?;

    println!(
        "{} Cancelled job {}",
        style("✓").green().bold(),
        style(job_id).cyan()
    );
    Ok(())
}
