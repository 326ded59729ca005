//! `hansard progress` - read a job's snapshot file.
//!
//! Reads the on-disk snapshot rather than any live process, so it works
//! after a crash and from a different terminal.

use anyhow::{Context, Result};
use hansard_core::{PipelineConfig, ProgressRecord};

pub fn run(job_id: String) -> Result<()> {
    let config = PipelineConfig::load()?;
    let path = config.progress_dir.join(format!("{job_id}.json"));
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("no progress snapshot for {job_id} at {}", path.display()))?;
    let record: ProgressRecord =
        serde_json::from_str(&raw).context("malformed progress snapshot")?;

    println!("job:      {}", record.hearing_id);
    println!("stage:    {:?}", record.stage);
    println!("progress: {}%", record.overall_percent);
    println!("message:  {}", record.message);
    if let Some(eta) = record.eta_seconds {
        println!("eta:      ~{eta}s");
    }
    if let Some(error) = &record.error {
        println!("error:    [{}] {}", error.kind, error.message);
    }
    if let Some(total) = record.total_slices {
        let done = record
            .per_slice
            .values()
            .filter(|state| state.is_terminal())
            .count();
        println!("slices:   {done}/{total} terminal");
        for (index, state) in &record.per_slice {
            println!("  slice {index:>3}: {state:?}");
        }
    }
    Ok(())
}
