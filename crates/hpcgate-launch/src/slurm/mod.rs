//! SLURM integration: batch scripts, queue scraping and the SSH-backed adapter.

mod adapter;
mod parser;
mod templates;

pub use adapter::{SSH_AGENT_SOCKET, SlurmAdapter};
pub use parser::{
    PollOutcome, SlurmState, parse_queue_line, parse_sbatch_output, parse_scancel_output,
    parse_slurm_state,
};
pub use templates::{
    CONNECTION_FILE_PLACEHOLDER, REMOTE_CONNECTION_FILE_PLACEHOLDER, generate_batch_script, render,
};
