//! hpcgate Command-Line Interface
//!
//! Launches a process as a SLURM job on a remote cluster and forwards its
//! ports to `127.0.0.1`.
//!
//! ```text
//! hpcgate launch --flags account=proj,time=01:00:00 \
//!     --connection-file kernel.json -- python -m ipykernel_launcher -f {connection_file}
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use console::style;
use hpcgate_launch::LoggingConfig;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::common::{JobArgs, RouteArgs, load_config};
use commands::{cancel, launch, render};

/// hpcgate - interactive processes on batch-scheduled compute nodes
#[derive(Parser)]
#[command(name = "hpcgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job, tunnel its ports and hold until Ctrl-C or job end
    Launch {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Print the batch script without contacting the cluster
    Render {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Cancel a SLURM job through the configured route
    Cancel {
        /// SLURM job id
        job_id: u64,

        #[command(flatten)]
        route: RouteArgs,
    },
}

impl Commands {
    fn route(&self) -> &RouteArgs {
        match self {
            Commands::Launch { job } | Commands::Render { job } => &job.route,
            Commands::Cancel { route, .. } => route,
        }
    }
}

/// Install the tracing subscriber on stderr.
///
/// `-v` flags win over `RUST_LOG`, which wins over the configured level.
fn init_tracing(verbose: u8, logging: &LoggingConfig) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let result = match load_config(cli.command.route()) {
        Ok(config) => {
            init_tracing(cli.verbose, &config.logging);
            match cli.command {
                Commands::Launch { job } => launch::execute(config, &job).await,
                Commands::Render { job } => render::execute(&config, &job),
                Commands::Cancel { job_id, .. } => cancel::execute(config, job_id).await,
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_launch() {
        let cli = Cli::try_parse_from([
            "hpcgate",
            "launch",
            "--flags",
            "account=x,time=00:10:00",
            "--env",
            "OMP_NUM_THREADS=4",
            "--login-host",
            "login.cluster.edu",
            "--user",
            "alice",
            "--",
            "python",
            "-m",
            "ipykernel_launcher",
            "-f",
            "{connection_file}",
        ])
        .unwrap();

        match cli.command {
            Commands::Launch { job } => {
                assert_eq!(job.flags.as_deref(), Some("account=x,time=00:10:00"));
                assert_eq!(job.env, vec!["OMP_NUM_THREADS=4"]);
                assert_eq!(job.route.login_host.as_deref(), Some("login.cluster.edu"));
                assert_eq!(job.route.user.as_deref(), Some("alice"));
                assert_eq!(job.command.len(), 5);
                assert_eq!(job.command[4], "{connection_file}");
            }
            _ => panic!("expected launch"),
        }
    }

    #[test]
    fn test_payload_flags_are_not_parsed() {
        let cli =
            Cli::try_parse_from(["hpcgate", "render", "--", "python", "-v", "--config", "x"])
                .unwrap();
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Commands::Render { job } => {
                assert!(job.route.config.is_none());
                assert_eq!(job.command, vec!["python", "-v", "--config", "x"]);
            }
            _ => panic!("expected render"),
        }
    }

    #[test]
    fn test_launch_requires_command() {
        assert!(Cli::try_parse_from(["hpcgate", "launch", "--flags", "account=x"]).is_err());
    }

    #[test]
    fn test_parse_cancel() {
        let cli = Cli::try_parse_from(["hpcgate", "-vv", "cancel", "4821", "--jump-host", "gw"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Cancel { job_id, route } => {
                assert_eq!(job_id, 4821);
                assert_eq!(route.jump_host.as_deref(), Some("gw"));
            }
            _ => panic!("expected cancel"),
        }
    }

    #[test]
    fn test_cancel_rejects_non_numeric_id() {
        assert!(Cli::try_parse_from(["hpcgate", "cancel", "abc"]).is_err());
    }
}
