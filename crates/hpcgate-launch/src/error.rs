//! Error handling for remote job launches.

use thiserror::Error;

/// Result type for launch operations.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Errors that can occur while launching, polling or tunnelling to a job.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Required configuration is missing. Raised before any I/O.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The batch script could not be rendered.
    #[error("Render error: {0}")]
    RenderError(String),

    /// The SSH transport could not connect or authenticate.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A bounded remote operation exceeded its timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote command ran but exited with a nonzero status.
    #[error("Remote command failed: {command} (exit code {exit_code}): {stderr}")]
    RemoteCommandError {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The submit output did not contain a job identifier.
    #[error("No job identifier in submit output: {0:?}")]
    NoJobIdentifier(String),

    /// A queue query line could not be understood.
    #[error("Could not parse queue output: {0:?}")]
    PollParseError(String),

    /// The job left the scheduler queue without a terminal state.
    #[error("Job {0} vanished from the queue")]
    VanishedJob(u64),

    /// The local port forward could not be established.
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    /// The operation is not valid for the job's current state.
    #[error("Invalid job state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    /// The job was cancelled before the operation could run.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LaunchError {
    /// Whether the poll loop should absorb this error and try again on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LaunchError::TransportError(_)
                | LaunchError::Timeout(_)
                | LaunchError::RemoteCommandError { .. }
                | LaunchError::PollParseError(_)
                | LaunchError::TunnelError(_)
        )
    }

    /// Captured remote stderr, if the error carries any.
    pub fn remote_stderr(&self) -> Option<&str> {
        match self {
            LaunchError::RemoteCommandError { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LaunchError::ConfigurationError("login host missing".to_string());
        assert_eq!(err.to_string(), "Configuration error: login host missing");

        let err = LaunchError::RemoteCommandError {
            command: "sbatch".to_string(),
            exit_code: 1,
            stderr: "invalid account".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Remote command failed: sbatch (exit code 1): invalid account"
        );

        let err = LaunchError::VanishedJob(4821);
        assert_eq!(err.to_string(), "Job 4821 vanished from the queue");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LaunchError::Timeout("squeue".into()).is_retryable());
        assert!(LaunchError::PollParseError("???".into()).is_retryable());
        assert!(LaunchError::TunnelError("bind".into()).is_retryable());
        assert!(!LaunchError::ConfigurationError("x".into()).is_retryable());
        assert!(!LaunchError::NoJobIdentifier("".into()).is_retryable());
        assert!(!LaunchError::VanishedJob(1).is_retryable());
    }

    #[test]
    fn test_remote_stderr() {
        let err = LaunchError::RemoteCommandError {
            command: "squeue".to_string(),
            exit_code: 1,
            stderr: "slurm_load_jobs error".to_string(),
        };
        assert_eq!(err.remote_stderr(), Some("slurm_load_jobs error"));
        assert_eq!(LaunchError::Timeout("x".into()).remote_stderr(), None);
    }
}
