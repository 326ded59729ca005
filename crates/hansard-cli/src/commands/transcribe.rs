//! `hansard transcribe` - run one job end to end.

use std::path::PathBuf;

use anyhow::Result;
use hansard_core::pipeline::SubmitOptions;
use hansard_core::services::ServiceSet;
use hansard_core::{info, PipelineConfig};

pub async fn run(
    audio: PathBuf,
    hearing: String,
    sequential: bool,
    skip_preflight: bool,
    language: Option<String>,
) -> Result<()> {
    let mut config = PipelineConfig::load()?;
    if language.is_some() {
        config.language = language;
    }
    let output_dir = config.output_dir.clone();
    let services = ServiceSet::start(config)?;

    let mut handle = services.submit(
        &hearing,
        audio,
        SubmitOptions {
            prefer_parallel: !sequential,
            skip_preflight,
        },
    );

    // Mirror progress updates for this job onto stderr.
    let mut updates = services.reporter().subscribe();
    let job_id = hearing.clone();
    let printer = tokio::spawn(async move {
        let mut last: Option<(String, u8)> = None;
        while let Ok(record) = updates.recv().await {
            if record.hearing_id != job_id {
                continue;
            }
            let line = (record.message.clone(), record.overall_percent);
            if last.as_ref() != Some(&line) {
                let eta = record
                    .eta_seconds
                    .map(|secs| format!(", ~{secs}s left"))
                    .unwrap_or_default();
                info!("[{:>3}%] {}{eta}", record.overall_percent, record.message);
                last = Some(line);
            }
            if record.stage.is_terminal() {
                break;
            }
        }
    });

    let outcome = tokio::select! {
        outcome = handle.await_result() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("cancelling...");
            handle.cancel();
            handle.await_result().await
        }
    };
    let _ = printer.await;

    let stats = services.stats().await;
    hansard_core::verbose!(
        "scratch dirs created {} reused {}, {} slice files cleaned ({} bytes), rss {} MiB",
        stats.pool.created,
        stats.pool.reused,
        stats.cleanup.items_cleaned,
        stats.cleanup.bytes_freed,
        stats.memory.current.process_rss_bytes / (1024 * 1024)
    );

    services.shutdown().await;
    let transcript = outcome?;

    let path = hansard_core::Transcript::output_path(&output_dir, &hearing);
    info!(
        "transcript: {} segments, {:.1} minutes, written to {}",
        transcript.segments.len(),
        transcript.duration_s / 60.0,
        path.display()
    );
    Ok(())
}
