//! `hansard preflight` - run the readiness gate standalone.

use std::path::PathBuf;

use anyhow::Result;
use hansard_core::services::ServiceSet;
use hansard_core::PipelineConfig;

pub async fn run(audio: PathBuf, hearing: String) -> Result<()> {
    let services = ServiceSet::start(PipelineConfig::load()?)?;
    let report = services.preflight(&audio, &hearing).await;
    services.shutdown().await;

    for check in &report.checks {
        let mark = if check.passed { "ok " } else { "FAIL" };
        println!("[{mark}] {:8} {}", check.name, check.detail);
    }
    println!();
    println!("readiness: {:.0}%", report.readiness_score);
    if let Some(estimates) = report.estimates {
        println!(
            "estimated: {} slice(s), {} API call(s), ~{:.1} min processing",
            estimates.slices, estimates.api_calls, estimates.estimated_minutes
        );
    }

    if !report.ready {
        anyhow::bail!("not ready: {}", report.failures().join("; "));
    }
    Ok(())
}
