//! Configuration management for hpcgate.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with HPCGATE_ prefix)
//! 3. .env files
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{DEFAULT_JOB_NAME, JobSpec};
use crate::transport::SshRoute;

/// Complete launcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// How to reach the cluster
    #[serde(default)]
    pub route: SshRoute,

    /// Scheduler defaults merged into every job
    #[serde(default)]
    pub slurm: SlurmSettings,

    /// Poll cadence, timeouts and retry budgets
    #[serde(default)]
    pub timing: TimingConfig,

    /// Refuse to submit without a running SSH agent
    #[serde(default = "default_true")]
    pub require_agent: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmSettings {
    /// Flags rendered as `#SBATCH --<key>=<value>`
    #[serde(default)]
    pub flags: BTreeMap<String, String>,

    /// Job name (`#SBATCH -J`)
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Environment exported before the payload runs
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds between queue polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for `sbatch`
    #[serde(default = "default_command_timeout")]
    pub submit_timeout_secs: u64,

    /// Timeout for `squeue`
    #[serde(default = "default_command_timeout")]
    pub query_timeout_secs: u64,

    /// Timeout for `scancel`
    #[serde(default = "default_command_timeout")]
    pub cancel_timeout_secs: u64,

    /// How long a fresh tunnel must stay up before it counts as open
    #[serde(default = "default_tunnel_grace")]
    pub tunnel_grace_millis: u64,

    /// Consecutive failed polls tolerated before the job is failed
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,

    /// Tunnel attempts before giving up on the forward
    #[serde(default = "default_max_tunnel_attempts")]
    pub max_tunnel_attempts: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "console" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_job_name() -> String {
    DEFAULT_JOB_NAME.to_string()
}

fn default_poll_interval() -> u64 {
    4
}

fn default_command_timeout() -> u64 {
    10
}

fn default_tunnel_grace() -> u64 {
    1500
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_max_tunnel_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            route: SshRoute::default(),
            slurm: SlurmSettings::default(),
            timing: TimingConfig::default(),
            require_agent: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SlurmSettings {
    fn default() -> Self {
        SlurmSettings {
            flags: BTreeMap::new(),
            job_name: default_job_name(),
            environment: BTreeMap::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            poll_interval_secs: default_poll_interval(),
            submit_timeout_secs: default_command_timeout(),
            query_timeout_secs: default_command_timeout(),
            cancel_timeout_secs: default_command_timeout(),
            tunnel_grace_millis: default_tunnel_grace(),
            max_poll_failures: default_max_poll_failures(),
            max_tunnel_attempts: default_max_tunnel_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    pub fn tunnel_grace(&self) -> Duration {
        Duration::from_millis(self.tunnel_grace_millis)
    }
}

impl LaunchConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::IoError(format!("{}: {e}", path.as_ref().display()))
        })?;

        let config: LaunchConfig = serde_yaml_ng::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// A job spec for `command` carrying the configured scheduler defaults.
    pub fn job_spec<I, S>(&self, command: I) -> JobSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = JobSpec::new(command)
            .with_job_name(self.slurm.job_name.clone())
            .with_flags(self.slurm.flags.clone());
        for (key, value) in &self.slurm.environment {
            spec = spec.with_env(key.clone(), value.clone());
        }
        spec
    }

    /// Default configuration file, `<config_dir>/hpcgate/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hpcgate").join("config.yaml"))
    }

    /// Load configuration with the following precedence:
    /// 1. Load .env file if it exists
    /// 2. Load from the given file, else the default file if present
    /// 3. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let path = match config_file {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.is_file()),
        };

        let mut config = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                Self::from_file(path)?
            }
            None => LaunchConfig::default(),
        };

        // Apply environment overrides
        config = config.merge_env();

        config.validate()?;
        Ok(config)
    }

    /// Merge `HPCGATE_*` process environment variables into this configuration.
    pub fn merge_env(self) -> Self {
        self.merge_env_with(|key| std::env::var(key).ok())
    }

    /// Merge environment overrides read through `lookup`.
    ///
    /// Only variables that are set override the file-loaded (or default)
    /// values; unparsable numbers are ignored.
    pub fn merge_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Route
        if let Some(v) = lookup("HPCGATE_LOGIN_HOST") {
            self.route.login_host = v;
        }
        if let Some(v) = lookup("HPCGATE_JUMP_HOST") {
            self.route = self.route.with_jump_host(v);
        }
        if let Some(v) = lookup("HPCGATE_USERNAME") {
            self.route.username = v;
        }

        // Timing
        if let Some(v) = lookup("HPCGATE_POLL_INTERVAL") {
            if let Ok(val) = v.parse() {
                self.timing.poll_interval_secs = val;
            }
        }

        // Logging
        if let Some(v) = lookup("HPCGATE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("HPCGATE_LOG_FORMAT") {
            self.logging.format = v;
        }

        self
    }

    /// Validate configuration values.
    ///
    /// The route may still be incomplete here; it is checked before submission.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate log level
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )));
            }
        }

        // Validate log format
        match self.logging.format.as_str() {
            "console" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {other}"
                )));
            }
        }

        // Validate timing
        if self.timing.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("submit_timeout_secs", self.timing.submit_timeout_secs),
            ("query_timeout_secs", self.timing.query_timeout_secs),
            ("cancel_timeout_secs", self.timing.cancel_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.timing.max_tunnel_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_tunnel_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = LaunchConfig::default();
        assert_eq!(config.timing.poll_interval(), Duration::from_secs(4));
        assert_eq!(config.timing.submit_timeout(), Duration::from_secs(10));
        assert_eq!(config.timing.tunnel_grace(), Duration::from_millis(1500));
        assert_eq!(config.timing.max_poll_failures, 5);
        assert_eq!(config.slurm.job_name, "jupyter_slurm_kernel");
        assert!(config.require_agent);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
route:
  login_host: login.cluster.edu
  jump_host: gate.example.org
  username: alice
slurm:
  flags:
    account: hpc-prf-xyz
    time: "00:10:00"
timing:
  poll_interval_secs: 2
require_agent: false
"#
        )
        .unwrap();

        let config = LaunchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.route.login_host, "login.cluster.edu");
        assert_eq!(config.route.jump_host.as_deref(), Some("gate.example.org"));
        assert_eq!(config.slurm.flags["time"], "00:10:00");
        assert_eq!(config.slurm.job_name, "jupyter_slurm_kernel");
        assert_eq!(config.timing.poll_interval_secs, 2);
        assert_eq!(config.timing.query_timeout_secs, 10);
        assert!(!config.require_agent);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            LaunchConfig::from_file("/nonexistent/hpcgate.yaml"),
            Err(ConfigError::IoError(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timing: [not, a, map]").unwrap();
        assert!(matches!(
            LaunchConfig::from_file(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_merge_env_with() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HPCGATE_LOGIN_HOST", "login2"),
            ("HPCGATE_USERNAME", "bob"),
            ("HPCGATE_JUMP_HOST", ""),
            ("HPCGATE_POLL_INTERVAL", "not-a-number"),
            ("HPCGATE_LOG_FORMAT", "json"),
        ]);

        let mut config = LaunchConfig::default();
        config.route = SshRoute::new("login1", "alice").with_jump_host("gate");
        let config = config.merge_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.route.login_host, "login2");
        assert_eq!(config.route.username, "bob");
        assert_eq!(config.route.jump_host, None);
        assert_eq!(config.timing.poll_interval_secs, 4);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_job_spec_carries_defaults() {
        let mut config = LaunchConfig::default();
        config.slurm.flags.insert("account".into(), "x".into());
        config.slurm.environment.insert("OMP_NUM_THREADS".into(), "4".into());
        config.slurm.job_name = "analysis".into();

        let spec = config.job_spec(["python", "run.py"]);
        assert_eq!(spec.job_name, "analysis");
        assert_eq!(spec.flags["account"], "x");
        assert_eq!(spec.environment["OMP_NUM_THREADS"], "4");
        assert_eq!(spec.command, vec!["python", "run.py"]);
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = LaunchConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = LaunchConfig::default();
        config.timing.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = LaunchConfig::default();
        config.timing.cancel_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
