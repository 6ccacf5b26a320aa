//! Shared arguments and helpers for CLI commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use hpcgate_launch::{ConnectionDescriptor, JobSpec, LaunchConfig, parse_flag_list};

/// How to reach the cluster. Overrides the configuration file.
#[derive(Args, Debug, Default)]
pub struct RouteArgs {
    /// Configuration file (default: <config_dir>/hpcgate/config.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Login host used for submission and polling
    #[arg(long)]
    pub login_host: Option<String>,

    /// Relay in front of the login host
    #[arg(long)]
    pub jump_host: Option<String>,

    /// Account on the login host
    #[arg(short, long)]
    pub user: Option<String>,
}

/// What to run and how to schedule it.
#[derive(Args, Debug, Default)]
pub struct JobArgs {
    #[command(flatten)]
    pub route: RouteArgs,

    /// Scheduler flags as key=value,key=value (merged over configured flags)
    #[arg(short, long)]
    pub flags: Option<String>,

    /// Environment variable exported before the payload runs (repeatable)
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Connection descriptor (e.g. a Jupyter kernel JSON file)
    #[arg(long)]
    pub connection_file: Option<PathBuf>,

    /// Job name
    #[arg(short = 'J', long)]
    pub job_name: Option<String>,

    /// Command to run on the compute node; `{connection_file}` names the descriptor
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Load the configuration and apply command-line route overrides.
pub fn load_config(route: &RouteArgs) -> Result<LaunchConfig> {
    let mut config =
        LaunchConfig::load(route.config.as_deref()).context("Failed to load configuration")?;

    if let Some(host) = &route.login_host {
        config.route.login_host.clone_from(host);
    }
    if let Some(jump) = &route.jump_host {
        config.route = config.route.with_jump_host(jump.clone());
    }
    if let Some(user) = &route.user {
        config.route.username.clone_from(user);
    }

    Ok(config)
}

/// Build a job spec from the configured defaults and the command line.
pub fn build_spec(config: &LaunchConfig, job: &JobArgs) -> Result<JobSpec> {
    let mut spec = config.job_spec(job.command.iter().cloned());

    if let Some(list) = &job.flags {
        spec.flags.extend(parse_flag_list(list)?);
    }

    for pair in &job.env {
        let (key, value) = parse_env_pair(pair)?;
        spec = spec.with_env(key, value);
    }

    if let Some(name) = &job.job_name {
        spec = spec.with_job_name(name.clone());
    }

    if let Some(path) = &job.connection_file {
        let connection = ConnectionDescriptor::from_file(path).with_context(|| {
            format!("Failed to read connection file: {}", path.display())
        })?;
        spec = spec.with_connection(connection);
    }

    Ok(spec)
}

fn parse_env_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => anyhow::bail!("Invalid environment variable '{pair}': expected KEY=VALUE"),
    }
}
