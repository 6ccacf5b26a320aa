//! Job types for remote launches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LaunchError, LaunchResult};

/// Job name used when none is configured.
pub const DEFAULT_JOB_NAME: &str = "jupyter_slurm_kernel";

/// Port names of a Jupyter kernel connection file.
pub const JUPYTER_PORT_NAMES: [&str; 5] = [
    "stdin_port",
    "shell_port",
    "iopub_port",
    "hb_port",
    "control_port",
];

/// A named port the remote payload listens on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub name: String,
    pub port: u16,
}

/// Named ports plus auxiliary fields handed to the payload at startup.
///
/// Serialises as one flat JSON object, the shape of a Jupyter connection file:
///
/// ```text
/// {"control_port": 50160, "hb_port": 50161, "ip": "127.0.0.1", "key": "..", ...}
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionDescriptor {
    /// Ports that are forwarded to the caller, keyed by name.
    pub ports: BTreeMap<String, u16>,
    /// Everything else the payload needs (transport, key, signature scheme, ...).
    pub fields: Map<String, Value>,
}

impl ConnectionDescriptor {
    /// Create an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named port.
    pub fn with_port(mut self, name: impl Into<String>, port: u16) -> Self {
        self.ports.insert(name.into(), port);
        self
    }

    /// Add an auxiliary field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Build a descriptor from a parsed JSON object.
    ///
    /// Integer values under keys ending in `_port` become ports, the rest are fields.
    pub fn from_value(value: Value) -> LaunchResult<Self> {
        let Value::Object(object) = value else {
            return Err(LaunchError::ConfigurationError(
                "connection descriptor must be a JSON object".to_string(),
            ));
        };

        let mut descriptor = Self::new();
        for (key, value) in object {
            let port = value
                .as_u64()
                .filter(|_| key.ends_with("_port"))
                .and_then(|p| u16::try_from(p).ok());
            match port {
                Some(port) => {
                    descriptor.ports.insert(key, port);
                }
                None => {
                    descriptor.fields.insert(key, value);
                }
            }
        }
        Ok(descriptor)
    }

    /// Parse a descriptor from JSON text.
    pub fn from_json(text: &str) -> LaunchResult<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Load a descriptor from a connection file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> LaunchResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Flatten into a single JSON object. Ports win over fields with the same key.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        for (name, port) in &self.ports {
            object.insert(name.clone(), Value::from(*port));
        }
        Value::Object(object)
    }

    /// Compact JSON text, as embedded in the batch script.
    pub fn to_json(&self) -> LaunchResult<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    /// The set of ports the tunnel must forward.
    pub fn forwarded_ports(&self) -> BTreeSet<ForwardedPort> {
        self.ports
            .iter()
            .map(|(name, port)| ForwardedPort {
                name: name.clone(),
                port: *port,
            })
            .collect()
    }
}

/// Everything needed to submit one job. Built once, never mutated after submission.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Value for `#SBATCH -J`.
    pub job_name: String,

    /// Scheduler flags rendered as `#SBATCH --<key>=<value>`.
    pub flags: BTreeMap<String, String>,

    /// Environment variables exported before the payload runs.
    pub environment: BTreeMap<String, String>,

    /// Payload command template. `{connection_file}` resolves to the descriptor path.
    pub command: Vec<String>,

    /// Ports and fields handed to the payload.
    pub connection: ConnectionDescriptor,
}

impl JobSpec {
    /// Create a spec for the given payload command.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_name: DEFAULT_JOB_NAME.to_string(),
            flags: BTreeMap::new(),
            environment: BTreeMap::new(),
            command: command.into_iter().map(Into::into).collect(),
            connection: ConnectionDescriptor::default(),
        }
    }

    /// Set the job name.
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    /// Add a scheduler flag.
    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }

    /// Merge a set of scheduler flags.
    pub fn with_flags(mut self, flags: BTreeMap<String, String>) -> Self {
        self.flags.extend(flags);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the connection descriptor.
    pub fn with_connection(mut self, connection: ConnectionDescriptor) -> Self {
        self.connection = connection;
        self
    }
}

/// Parse a `key=value,key=value` scheduler flag list.
///
/// Whitespace around keys and values is trimmed; empty items are skipped.
pub fn parse_flag_list(list: &str) -> LaunchResult<BTreeMap<String, String>> {
    let mut flags = BTreeMap::new();
    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let Some((key, value)) = item.split_once('=') else {
            return Err(LaunchError::ConfigurationError(format!(
                "scheduler flag '{item}' is not of the form key=value"
            )));
        };
        let key = key.trim().trim_start_matches("--");
        if key.is_empty() {
            return Err(LaunchError::ConfigurationError(format!(
                "scheduler flag '{item}' has an empty key"
            )));
        }
        flags.insert(key.to_string(), value.trim().to_string());
    }
    Ok(flags)
}

/// Lifecycle state of a launched job.
///
/// The scheduler-facing machine is `Submitted -> {Pending <-> Running} -> {Completed | Vanished}`.
/// `Unsubmitted`, `Cancelled` and `Failed` cover the handle before submission, after an
/// external cancel, and after the poll loop ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Unsubmitted,
    Submitted,
    Pending,
    Running,
    Completed,
    Vanished,
    Cancelled,
    Failed,
}

impl JobState {
    /// Terminal states stop the poll loop and tear down the tunnel.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Vanished | JobState::Cancelled | JobState::Failed
        )
    }

    /// Get a human-readable state name.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Unsubmitted => "UNSUBMITTED",
            JobState::Submitted => "SUBMITTED",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Vanished => "VANISHED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of a job handle, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Scheduler-assigned id, set at most once.
    pub job_id: Option<u64>,
    pub state: JobState,
    /// Compute node, only while `state == Running`.
    pub exec_node: Option<String>,
    /// Scheduler's start estimate while pending.
    pub estimated_start: Option<String>,
    pub tunnel_active: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Why the job ended abnormally (`Failed`, `Vanished`).
    #[serde(default)]
    pub reason: Option<String>,
}

impl JobSnapshot {
    /// Snapshot of a handle that has not been submitted yet.
    pub fn unsubmitted() -> Self {
        Self {
            job_id: None,
            state: JobState::Unsubmitted,
            exec_node: None,
            estimated_start: None,
            tunnel_active: false,
            submitted_at: None,
            last_polled_at: None,
            reason: None,
        }
    }
}

impl Default for JobSnapshot {
    fn default() -> Self {
        Self::unsubmitted()
    }
}
