//! SLURM adapter for job submission and tracking over SSH.

use std::sync::Arc;

use crate::config::TimingConfig;
use crate::context::LaunchContext;
use crate::error::{LaunchError, LaunchResult};
use crate::job::JobSpec;
use crate::slurm::parser::{self, PollOutcome};
use crate::slurm::templates;
use crate::transport::{RemoteCommand, RemoteExecutor, SshRoute};

/// Environment variable that points at a running SSH agent.
pub const SSH_AGENT_SOCKET: &str = "SSH_AUTH_SOCK";

/// Format string for `squeue -o`: state and node list.
const QUEUE_FORMAT: &str = "%T %B";

/// SLURM adapter: submits, polls and cancels jobs on a remote cluster.
///
/// Every operation is one round trip through the [`RemoteExecutor`].
pub struct SlurmAdapter {
    route: SshRoute,
    executor: Arc<dyn RemoteExecutor>,
    timing: TimingConfig,
    require_agent: bool,
    context: Arc<LaunchContext>,
}

impl SlurmAdapter {
    /// Create an adapter for `route`.
    pub fn new(
        route: SshRoute,
        executor: Arc<dyn RemoteExecutor>,
        timing: TimingConfig,
        context: Arc<LaunchContext>,
    ) -> Self {
        Self {
            route,
            executor,
            timing,
            require_agent: false,
            context,
        }
    }

    /// Require `SSH_AUTH_SOCK` to be set before submitting.
    pub fn with_agent_check(mut self, require_agent: bool) -> Self {
        self.require_agent = require_agent;
        self
    }

    /// The route this adapter talks through.
    pub fn route(&self) -> &SshRoute {
        &self.route
    }

    /// Pre-flight checks. Never touches the network.
    pub fn validate(&self, spec: &JobSpec) -> LaunchResult<()> {
        let agent_running = std::env::var_os(SSH_AGENT_SOCKET).is_some_and(|s| !s.is_empty());
        self.validate_with(spec, agent_running)
    }

    fn validate_with(&self, spec: &JobSpec, agent_running: bool) -> LaunchResult<()> {
        if spec.flags.is_empty() {
            return Err(LaunchError::ConfigurationError(
                "no scheduler flags given; provide at least one (e.g. account=...)".to_string(),
            ));
        }
        self.route.validate()?;
        if self.require_agent && !agent_running {
            return Err(LaunchError::ConfigurationError(format!(
                "SSH agent is not running ({SSH_AGENT_SOCKET} unset); start it with: eval $(ssh-agent)"
            )));
        }
        Ok(())
    }

    /// Submit a job and return its SLURM job id.
    pub async fn submit(&self, spec: &JobSpec) -> LaunchResult<u64> {
        self.validate(spec)?;
        let script = templates::generate_batch_script(spec)?;
        tracing::debug!(script = %script, "Rendered batch script");

        let command = RemoteCommand::new(["sbatch", "--parsable"]).with_stdin(script);
        let output = self
            .executor
            .run(&self.route, command, self.timing.submit_timeout())
            .await?;

        let job_id = parser::parse_sbatch_output(&output.stdout, &output.stderr)?;
        self.context.record_submission();
        tracing::info!(
            job_id,
            login_host = %self.route.describe(),
            "Submitted SLURM job"
        );
        Ok(job_id)
    }

    /// Query the queue once for `job_id`.
    ///
    /// A scheduler that no longer knows the id reports the job as vanished.
    pub async fn poll(&self, job_id: u64) -> LaunchResult<PollOutcome> {
        let result = self.run_squeue(job_id).await;
        self.context.record_poll(result.is_ok());
        let outcome = result?;

        tracing::debug!(
            job_id,
            state = %outcome.state,
            node = ?outcome.node,
            "Polled SLURM job"
        );
        if outcome.is_running_without_node() {
            tracing::warn!(job_id, "Job is running but squeue reported no usable node");
        }
        Ok(outcome)
    }

    async fn run_squeue(&self, job_id: u64) -> LaunchResult<PollOutcome> {
        let id = job_id.to_string();
        let command = RemoteCommand::new(["squeue", "-h", "-j", &id, "-o", QUEUE_FORMAT]);

        match self
            .executor
            .run(&self.route, command, self.timing.query_timeout())
            .await
        {
            Ok(output) => parser::parse_queue_line(&output.stdout),
            Err(err) if err.remote_stderr().is_some_and(parser::is_unknown_job) => {
                Ok(PollOutcome::vanished())
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a SLURM job. A job that is already gone counts as cancelled.
    pub async fn cancel(&self, job_id: u64) -> LaunchResult<()> {
        let id = job_id.to_string();
        let command = RemoteCommand::new(["scancel", &id]);

        let result = match self
            .executor
            .run(&self.route, command, self.timing.cancel_timeout())
            .await
        {
            Ok(output) => parser::parse_scancel_output(&output.stderr),
            Err(LaunchError::RemoteCommandError { stderr, .. }) => {
                parser::parse_scancel_output(&stderr)
            }
            Err(err) => Err(err),
        };

        if result.is_ok() {
            self.context.record_cancellation();
            tracing::info!(job_id, "Cancelled SLURM job");
        }
        result
    }
}

impl std::fmt::Debug for SlurmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlurmAdapter")
            .field("route", &self.route)
            .field("timing", &self.timing)
            .field("require_agent", &self.require_agent)
            .finish_non_exhaustive()
    }
}
