//! Render command implementation.
//!
//! Prints the batch script a launch would submit. Nothing leaves the machine.

use anyhow::Result;

use hpcgate_launch::{LaunchConfig, generate_batch_script};

use super::common::{JobArgs, build_spec};

/// Execute the render command.
pub fn execute(config: &LaunchConfig, job: &JobArgs) -> Result<()> {
    let spec = build_spec(config, job)?;
    let script = generate_batch_script(&spec)?;
    print!("{script}");
    Ok(())
}
