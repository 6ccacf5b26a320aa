//! SLURM batch script templates.

use std::collections::BTreeMap;

use crate::error::{LaunchError, LaunchResult};
use crate::job::{ConnectionDescriptor, JobSpec};
use crate::transport::shell_escape;

/// Placeholder in the payload command that resolves to the descriptor file.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Older kernelspec spelling of [`CONNECTION_FILE_PLACEHOLDER`].
pub const REMOTE_CONNECTION_FILE_PLACEHOLDER: &str = "{remote_connection_file}";

/// Shell expression the placeholder renders to.
const CONNECTION_FILE_VAR: &str = "\"$connection_file\"";

/// Generate the SLURM batch script for a job spec.
pub fn generate_batch_script(spec: &JobSpec) -> LaunchResult<String> {
    render(
        &spec.job_name,
        &spec.flags,
        &spec.environment,
        &spec.command,
        &spec.connection,
    )
}

/// Render a batch script. Deterministic and free of I/O.
///
/// The connection descriptor is written to a temp file on the compute node
/// whose path the payload reads through `$connection_file`.
pub fn render(
    job_name: &str,
    flags: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
    command: &[String],
    connection: &ConnectionDescriptor,
) -> LaunchResult<String> {
    let payload = render_command(command)?;
    let descriptor = connection.to_json()?;

    let mut script = String::new();

    // Shebang
    script.push_str("#!/bin/bash\n");

    // SLURM directives
    script.push_str(&format!("#SBATCH -J {}\n", sanitize_name(job_name)));
    for (key, value) in flags {
        let key = key.trim_start_matches("--");
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(LaunchError::RenderError(format!(
                "invalid scheduler flag name '{key}'"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(LaunchError::RenderError(format!(
                "scheduler flag '{key}' has a value with control characters"
            )));
        }
        script.push_str(&format!("#SBATCH --{key}={value}\n"));
    }

    // Connection descriptor
    script.push_str("\ntmpfile=$(mktemp)\n");
    script.push_str("cat << 'EOF' > $tmpfile\n");
    script.push_str(&descriptor);
    script.push_str("\nEOF\n");
    script.push_str("connection_file=$tmpfile\n\n");

    // Extra environment
    for (key, value) in env {
        if !is_shell_identifier(key) {
            return Err(LaunchError::RenderError(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        script.push_str(&format!("export {key}={}\n", shell_escape(value)));
    }
    if !env.is_empty() {
        script.push('\n');
    }

    // Payload
    script.push_str(&payload);
    script.push('\n');

    Ok(script)
}

/// Resolve the payload command template into one shell line.
fn render_command(command: &[String]) -> LaunchResult<String> {
    if command.iter().all(|arg| arg.trim().is_empty()) {
        return Err(LaunchError::RenderError(
            "missing payload command".to_string(),
        ));
    }

    let mut rendered = Vec::with_capacity(command.len());
    for arg in command {
        if let Some(name) = unresolved_placeholder(arg) {
            return Err(LaunchError::RenderError(format!(
                "unresolved placeholder '{{{name}}}' in payload command"
            )));
        }
        rendered.push(render_arg(arg));
    }
    Ok(rendered.join(" "))
}

/// Quote one argument, substituting the connection file placeholder.
fn render_arg(arg: &str) -> String {
    let arg = arg.replace(REMOTE_CONNECTION_FILE_PLACEHOLDER, CONNECTION_FILE_PLACEHOLDER);
    if !arg.contains(CONNECTION_FILE_PLACEHOLDER) {
        return shell_escape(&arg);
    }
    arg.split(CONNECTION_FILE_PLACEHOLDER)
        .map(|piece| {
            if piece.is_empty() {
                String::new()
            } else {
                shell_escape(piece)
            }
        })
        .collect::<Vec<_>>()
        .join(CONNECTION_FILE_VAR)
}

/// First `{identifier}` in `arg` other than the connection file placeholders.
///
/// Shell expansions such as `${HOME}` are left alone.
fn unresolved_placeholder(arg: &str) -> Option<&str> {
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let expansion = rest[..start].ends_with('$');
        let after = &rest[start + 1..];
        if let Some(end) = after.find('}') {
            let name = &after[..end];
            if !expansion
                && is_shell_identifier(name)
                && !matches!(name, "connection_file" | "remote_connection_file")
            {
                return Some(name);
            }
        }
        rest = after;
    }
    None
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Sanitize a job name for SLURM.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64) // SLURM has a 64 character limit for job names
        .collect()
}
