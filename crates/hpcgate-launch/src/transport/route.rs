//! SSH routes to the cluster.

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, LaunchResult};

/// How to reach the cluster's login host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshRoute {
    /// Login host used for submission and polling.
    #[serde(default)]
    pub login_host: String,

    /// Optional relay in front of the login host (`ssh -J`).
    #[serde(default)]
    pub jump_host: Option<String>,

    /// Account on the login host.
    #[serde(default)]
    pub username: String,
}

impl SshRoute {
    /// Create a direct route to `login_host`.
    pub fn new(login_host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            login_host: login_host.into(),
            jump_host: None,
            username: username.into(),
        }
    }

    /// Reach the login host through `jump_host`.
    pub fn with_jump_host(mut self, jump_host: impl Into<String>) -> Self {
        let jump_host = jump_host.into();
        self.jump_host = (!jump_host.trim().is_empty()).then_some(jump_host);
        self
    }

    /// Check that the route names a login host and a user.
    pub fn validate(&self) -> LaunchResult<()> {
        if self.login_host.trim().is_empty() {
            return Err(LaunchError::ConfigurationError(
                "unknown login host".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(LaunchError::ConfigurationError(format!(
                "cannot log in to {}: unknown username",
                self.describe()
            )));
        }
        Ok(())
    }

    /// `user@login`, the destination of every executor call.
    pub fn login_destination(&self) -> String {
        format!("{}@{}", self.username, self.login_host)
    }

    /// Human-readable route, e.g. `login.cluster.edu (via gate.example.org)`.
    pub fn describe(&self) -> String {
        match &self.jump_host {
            Some(jump) => format!("{} (via {})", self.login_host, jump),
            None => self.login_host.clone(),
        }
    }

    /// Relay hops needed to reach `target`, in order.
    ///
    /// A compute node sits behind the login host, so the chain is
    /// `[jump?, user@login]`. When the target is the login host itself only the
    /// jump host (if any) remains.
    pub fn hops_to(&self, target: &str) -> Vec<String> {
        let mut hops: Vec<String> = self.jump_host.iter().cloned().collect();
        if target != self.login_host {
            hops.push(self.login_destination());
        }
        hops
    }

    /// ssh arguments addressing the login host: `[-J jump] -l user login`.
    pub fn login_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(5);
        if let Some(jump) = &self.jump_host {
            args.push("-J".to_string());
            args.push(jump.clone());
        }
        args.push("-l".to_string());
        args.push(self.username.clone());
        args.push(self.login_host.clone());
        args
    }
}

/// Quote a string for a POSIX shell.
///
/// Wraps the value in single quotes and escapes any embedded single quotes
/// using the `'\''` idiom. Plain words are returned bare.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@%=,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
