use clap::{Parser, Subcommand};

/// Periodic analytics job orchestration: beat scheduler, worker pools and
/// operator tools.
#[derive(Parser, Debug)]
#[command(name = "volitas", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the beat scheduler (one active instance per deployment).
    Beat,
    /// Run a worker pool for one queue and serve health/readiness over HTTP.
    Worker {
        #[arg(long, env = "VOLITAS_QUEUE")]
        queue: String,
    },
    /// Submit an ad hoc job and print its id.
    Submit {
        #[arg(long)]
        kind: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Explicit idempotency key; derived from kind and payload when omitted.
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the status of a job.
    Status { job_id: String },
    /// Inspect or replay dead-lettered jobs.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Print the loaded routing table.
    Routes,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    List,
    /// Re-submit a dead job with a fresh attempt count.
    Requeue { job_id: String },
}
