//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "hansard",
    version,
    about = "Chunked, parallel transcription for legislative hearing audio"
)]
pub struct Cli {
    /// Print diagnostic detail
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe a hearing recording
    Transcribe {
        /// Path to the audio file
        audio: PathBuf,
        /// Hearing id this recording belongs to
        #[arg(long)]
        hearing: String,
        /// Submit slices one at a time instead of in parallel
        #[arg(long)]
        sequential: bool,
        /// Skip the preflight readiness gate
        #[arg(long)]
        skip_preflight: bool,
        /// ISO-639-1 language hint, e.g. "en"
        #[arg(long)]
        language: Option<String>,
    },

    /// Show audio metadata for a file
    Probe {
        /// Path to the audio file
        audio: PathBuf,
    },

    /// Run the readiness checks without starting a job
    Preflight {
        /// Path to the audio file
        audio: PathBuf,
        /// Hearing id to validate against the metadata store
        #[arg(long)]
        hearing: String,
    },

    /// Show the stored progress snapshot for a job
    Progress {
        /// Job (hearing) id
        job_id: String,
    },

    /// Manage hearing metadata rows
    Hearing {
        #[command(subcommand)]
        action: HearingAction,
    },

    /// Store the speech API key in the system keyring
    Setup,
}

#[derive(Subcommand)]
pub enum HearingAction {
    /// Add or update a hearing record
    Add {
        /// Hearing id
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        committee: String,
        /// Hearing date, e.g. 2025-06-12
        #[arg(long)]
        date: String,
    },
    /// Show a hearing record
    Show {
        /// Hearing id
        id: String,
    },
}
