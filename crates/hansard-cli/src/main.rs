mod args;
mod commands;
mod error;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() {
    // Environment fallbacks (OPENAI_API_KEY) may live in a .env file.
    dotenvy::dotenv().ok();

    if let Err(err) = run().await {
        error::display_anyhow_error(err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = args::Cli::parse();
    hansard_core::set_verbose(cli.verbose);

    match cli.command {
        args::Commands::Transcribe {
            audio,
            hearing,
            sequential,
            skip_preflight,
            language,
        } => commands::transcribe::run(audio, hearing, sequential, skip_preflight, language).await,
        args::Commands::Probe { audio } => commands::probe::run(audio).await,
        args::Commands::Preflight { audio, hearing } => {
            commands::preflight::run(audio, hearing).await
        }
        args::Commands::Progress { job_id } => commands::progress::run(job_id),
        args::Commands::Hearing { action } => commands::hearing::run(action),
        args::Commands::Setup => commands::setup::run(),
    }
}
