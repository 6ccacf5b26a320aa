//! Parsers for SLURM command output.

use crate::error::{LaunchError, LaunchResult};
use crate::job::JobState;

/// SLURM job state, as printed by `squeue -o %T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Configuring,
    Suspended,
    Requeued,
    Running,
    Completing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    NodeFail,
    Preempted,
    OutOfMemory,
    Unknown(String),
}

impl SlurmState {
    /// Check if the job has left the pending/running phase for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlurmState::Completing
                | SlurmState::Completed
                | SlurmState::Failed
                | SlurmState::Timeout
                | SlurmState::Cancelled
                | SlurmState::NodeFail
                | SlurmState::Preempted
                | SlurmState::OutOfMemory
        )
    }

    /// Canonical job state, or `None` for states we do not understand.
    pub fn job_state(&self) -> Option<JobState> {
        match self {
            SlurmState::Pending
            | SlurmState::Configuring
            | SlurmState::Suspended
            | SlurmState::Requeued => Some(JobState::Pending),
            SlurmState::Running => Some(JobState::Running),
            state if state.is_terminal() => Some(JobState::Completed),
            _ => None,
        }
    }
}

/// Result of one queue query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Canonical state: `Pending`, `Running`, `Completed` or `Vanished`.
    pub state: JobState,
    /// Raw scheduler state, absent when the job is no longer queued.
    pub slurm_state: Option<SlurmState>,
    /// Compute node, only for a running job with a well-formed node token.
    pub node: Option<String>,
    /// Scheduler's start estimate for a pending job.
    pub eta: Option<String>,
}

impl PollOutcome {
    /// The job is no longer in the queue.
    pub fn vanished() -> Self {
        Self {
            state: JobState::Vanished,
            slurm_state: None,
            node: None,
            eta: None,
        }
    }

    /// Running, but the node column was missing or unusable.
    pub fn is_running_without_node(&self) -> bool {
        self.state == JobState::Running && self.node.is_none()
    }
}

/// Extract the job id from `sbatch --parsable` output.
///
/// The first integer token wins. Tokens are split on whitespace and `;`
/// (`4821;cluster` in federated setups) and stripped of surrounding
/// punctuation, so log noise from login profiles is tolerated. stdout is
/// scanned before stderr.
pub fn parse_sbatch_output(stdout: &str, stderr: &str) -> LaunchResult<u64> {
    first_integer_token(stdout)
        .or_else(|| first_integer_token(stderr))
        .ok_or_else(|| {
            let mut scanned = stdout.trim().to_string();
            if !stderr.trim().is_empty() {
                if !scanned.is_empty() {
                    scanned.push('\n');
                }
                scanned.push_str(stderr.trim());
            }
            LaunchError::NoJobIdentifier(scanned)
        })
}

fn first_integer_token(text: &str) -> Option<u64> {
    text.split(|c: char| c.is_whitespace() || c == ';')
        .map(|token| token.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()))
        .find_map(|token| token.parse().ok())
}

/// Parse one line of `squeue -h -j <id> -o '%T %B'` output.
///
/// Empty output means the job is no longer queued.
pub fn parse_queue_line(output: &str) -> LaunchResult<PollOutcome> {
    let Some(line) = output.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(PollOutcome::vanished());
    };

    let mut fields = line.split_whitespace();
    let state_token = fields.next().unwrap_or_default();
    let second = fields.next().map(str::to_string);

    let slurm_state = parse_slurm_state(state_token);
    let state = slurm_state
        .job_state()
        .ok_or_else(|| LaunchError::PollParseError(line.to_string()))?;

    let (node, eta) = match state {
        JobState::Running => (second.filter(|node| is_node_name(node)), None),
        JobState::Pending => (None, second),
        _ => (None, None),
    };

    Ok(PollOutcome {
        state,
        slurm_state: Some(slurm_state),
        node,
        eta,
    })
}

/// Parse SLURM state string.
pub fn parse_slurm_state(state: &str) -> SlurmState {
    match state.to_uppercase().as_str() {
        "PENDING" | "PD" => SlurmState::Pending,
        "CONFIGURING" | "CF" => SlurmState::Configuring,
        "SUSPENDED" | "S" => SlurmState::Suspended,
        "REQUEUED" | "RQ" => SlurmState::Requeued,
        "RUNNING" | "R" => SlurmState::Running,
        "COMPLETING" | "CG" => SlurmState::Completing,
        "COMPLETED" | "CD" => SlurmState::Completed,
        "FAILED" | "F" => SlurmState::Failed,
        "TIMEOUT" | "TO" => SlurmState::Timeout,
        "CANCELLED" | "CA" => SlurmState::Cancelled,
        "NODE_FAIL" | "NF" => SlurmState::NodeFail,
        "PREEMPTED" | "PR" => SlurmState::Preempted,
        "OUT_OF_MEMORY" | "OOM" => SlurmState::OutOfMemory,
        _ => SlurmState::Unknown(state.to_string()),
    }
}

/// A hostname-like token. Rejects placeholders such as `(null)` or `n/a`.
fn is_node_name(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Whether scheduler stderr says the job is already gone.
pub fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Invalid job id") || stderr.contains("does not exist")
}

/// Classify `scancel` stderr.
///
/// A job that is already gone or finishing counts as cancelled.
pub fn parse_scancel_output(stderr: &str) -> LaunchResult<()> {
    let stderr = stderr.trim();
    if stderr.is_empty() || is_unknown_job(stderr) || stderr.contains("already completing") {
        return Ok(());
    }

    Err(LaunchError::RemoteCommandError {
        command: "scancel".to_string(),
        exit_code: 1,
        stderr: stderr.to_string(),
    })
}
