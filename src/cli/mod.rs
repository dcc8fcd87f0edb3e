//! Command-line interface.
//!
//! The HTTP surface in front of this system is a separate service; the
//! CLI exposes the same contract for operators and local work: submit a
//! document, run workers, inspect job state, or run the pipeline
//! one-shot without any job machinery.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "deid", version, about = "PHI de-identification for scanned medical documents")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a document to the PHI bucket and create a pending job.
    Submit {
        /// Document to de-identify (TIFF or PDF).
        file: PathBuf,

        /// Masking level: safe_harbor, limited_dataset, or custom.
        #[arg(long)]
        level: Option<String>,
    },

    /// Process queued jobs.
    Worker {
        /// Execute at most one job, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Show one job.
    Status {
        job_id: Uuid,
    },

    /// List recent jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// List the PHI entities persisted for a completed job.
    Entities {
        job_id: Uuid,
    },

    /// De-identify a local file without the job machinery.
    Run {
        /// Document to de-identify (TIFF or PDF).
        file: PathBuf,

        /// Where to write the masked document.
        #[arg(short, long)]
        output: PathBuf,

        /// Masking level: safe_harbor, limited_dataset, or custom.
        #[arg(long)]
        level: Option<String>,

        /// Paint translucent per-category masks instead of opaque
        /// black. Refused in production; output is NOT de-identified.
        #[arg(long)]
        debug_masks: bool,
    },
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = crate::config::Settings::from_env();

    match cli.command {
        Command::Submit { file, level } => commands::submit(&settings, &file, level).await,
        Command::Worker { once } => commands::worker(&settings, once).await,
        Command::Status { job_id } => commands::status(&settings, job_id).await,
        Command::Jobs { limit } => commands::jobs(&settings, limit).await,
        Command::Entities { job_id } => commands::entities(&settings, job_id).await,
        Command::Run {
            file,
            output,
            level,
            debug_masks,
        } => commands::run_local(&settings, &file, &output, level, debug_masks).await,
    }
}
