//! Launch command implementation.
//!
//! Submits the job, forwards its ports once it runs, and holds the session
//! open until Ctrl-C or until the job ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use hpcgate_launch::{
    JobEvent, JobSnapshot, JobState, LaunchConfig, Orchestrator, SshExecutor, SshTunnelLauncher,
};

use super::common::{JobArgs, build_spec};

/// Execute the launch command.
pub async fn execute(config: LaunchConfig, job: &JobArgs) -> Result<()> {
    let spec = build_spec(&config, job)?;

    println!(
        "{} Submitting {} via {}",
        style("→").cyan().bold(),
        style(&spec.job_name).green(),
        style(config.route.describe()).yellow()
    );

    let launcher = SshTunnelLauncher::new(config.timing.tunnel_grace());
    let orchestrator = Orchestrator::new(config, Arc::new(SshExecutor::new()), Arc::new(launcher));
    let mut handle = orchestrator
        .submit(spec)
        .await
        .context("Submission failed")?;
    let job_id = handle.job_id().unwrap_or_default();

    println!("  Job ID: {}", style(job_id).cyan());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message("Waiting for the job to start...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let terminal = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                spinner.set_message("Shutting down...");
                break None;
            }
            event = handle.next_event() => match event {
                Some(JobEvent::StateChanged { to, .. }) => {
                    spinner.set_message(format!("Job {job_id}: {to}"));
                }
                Some(JobEvent::TunnelOpened { node, ports }) => {
                    spinner.suspend(|| {
                        println!(
                            "{} Job {} is running on {}",
                            style("✓").green().bold(),
                            job_id,
                            style(&node).cyan()
                        );
                        for port in &ports {
                            println!(
                                "  {:<14} 127.0.0.1:{}",
                                port.name,
                                style(port.port).yellow()
                            );
                        }
                    });
                    spinner.set_message("Tunnel open. Press Ctrl-C to stop the job.");
                }
                Some(JobEvent::TunnelFailed { attempt, error }) => {
                    spinner.println(format!(
                        "{} Tunnel attempt {attempt} failed: {error}",
                        style("!").yellow().bold()
                    ));
                }
                Some(JobEvent::TunnelGaveUp { attempts }) => {
                    spinner.println(format!(
                        "{} Giving up on the tunnel after {attempts} attempts; the job keeps running",
                        style("✗").red().bold()
                    ));
                }
                Some(JobEvent::Terminal(snapshot)) => break Some(snapshot),
                None => break None,
            }
        }
    };

    handle.shutdown().await;
    spinner.finish_and_clear();

    let snapshot = terminal.unwrap_or_else(|| handle.status());
    report(&snapshot)
}

fn report(snapshot: &JobSnapshot) -> Result<()> {
    let job_id = snapshot.job_id.unwrap_or_default();
    match snapshot.state {
        JobState::Completed | JobState::Cancelled => {
            println!(
                "{} Job {} {}",
                style("✓").green().bold(),
                job_id,
                snapshot.state
            );
            Ok(())
        }
        state => match &snapshot.reason {
            Some(reason) => anyhow::bail!("Job {job_id} ended as {state}: {reason}"),
            None => anyhow::bail!("Job {job_id} ended as {state}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report() {
        let mut snapshot = JobSnapshot::unsubmitted();
        snapshot.job_id = Some(7);

        snapshot.state = JobState::Cancelled;
        assert!(report(&snapshot).is_ok());

        snapshot.state = JobState::Completed;
        assert!(report(&snapshot).is_ok());

        snapshot.state = JobState::Vanished;
        snapshot.reason = Some("Job 7 vanished from the queue".into());
        let err = report(&snapshot).unwrap_err();
        assert!(err.to_string().contains("vanished from the queue"));

        snapshot.state = JobState::Failed;
        assert!(report(&snapshot).is_err());
    }
}
