//! Pre-processing readiness checks.
//!
//! Four independent checks run concurrently before a job does any work:
//! system resources, the audio file itself, speech-API access, and the
//! hearing metadata record. The result is a composite of every failing item
//! rather than the first one, with a readiness score for the UI.

use std::path::Path;
use std::time::Duration;

use crate::audio::{self, AudioMetadata};
use crate::configuration::PipelineConfig;
use crate::credentials;
use crate::http::get_http_client;
use crate::provider::SpeechBackend;
use crate::store::HearingStore;
use crate::verbose;

/// Minimum free system memory.
const MIN_FREE_MEMORY_BYTES: u64 = 500 * 1024 * 1024;
/// Minimum free disk space on the scratch volume.
const MIN_FREE_DISK_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// CPU usage ceiling.
const MAX_CPU_PERCENT: f32 = 90.0;
/// Liveness probe timeout.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted container extensions.
const SUPPORTED_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "m4a", "aac"];
/// Largest accepted input.
const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
/// Shortest accepted recording.
const MIN_DURATION_SECONDS: f64 = 5.0;
/// Longest accepted recording.
const MAX_DURATION_SECONDS: f64 = 10.0 * 3600.0;

/// One named check outcome.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Informational estimates derived from the audio check.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingEstimates {
    pub slices: usize,
    pub api_calls: usize,
    pub estimated_minutes: f64,
}

/// Composite preflight outcome.
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub ready: bool,
    pub readiness_score: f64,
    pub checks: Vec<CheckResult>,
    /// Present when the audio check got far enough to probe the file.
    pub metadata: Option<AudioMetadata>,
    pub estimates: Option<ProcessingEstimates>,
}

impl PreflightReport {
    /// Failing items as `name: detail` strings.
    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| format!("{}: {}", check.name, check.detail))
            .collect()
    }
}

/// Run all four checks concurrently.
pub async fn run_preflight(
    audio_path: &Path,
    hearing_id: &str,
    config: &PipelineConfig,
    store: &HearingStore,
    backend: &dyn SpeechBackend,
) -> PreflightReport {
    let (system, audio, api, hearing) = tokio::join!(
        check_system(config),
        check_audio(audio_path, config),
        check_api(backend),
        check_hearing(store, hearing_id),
    );

    let (audio_check, metadata, estimates) = audio;
    let checks = vec![system, audio_check, api, hearing];
    let passed = checks.iter().filter(|check| check.passed).count();
    let report = PreflightReport {
        ready: passed == checks.len(),
        readiness_score: passed as f64 / checks.len() as f64 * 100.0,
        checks,
        metadata,
        estimates,
    };
    verbose!(
        "preflight for {hearing_id}: ready={}, score={:.0}",
        report.ready,
        report.readiness_score
    );
    report
}

async fn check_system(config: &PipelineConfig) -> CheckResult {
    let outcome = tokio::task::spawn_blocking({
        let scratch_root = config.scratch_root.clone();
        move || {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            let available = sys.available_memory();

            let free_disk = scratch_free_space(&scratch_root);

            // Two refreshes with a pause in between make the usage figure real.
            sys.refresh_cpu_usage();
            std::thread::sleep(Duration::from_millis(250));
            sys.refresh_cpu_usage();
            let cpu = sys.global_cpu_info().cpu_usage();

            let mut issues = Vec::new();
            if available < MIN_FREE_MEMORY_BYTES {
                issues.push(format!(
                    "insufficient memory: {} MiB free, need {} MiB",
                    available / (1024 * 1024),
                    MIN_FREE_MEMORY_BYTES / (1024 * 1024)
                ));
            }
            if free_disk < MIN_FREE_DISK_BYTES {
                issues.push(format!(
                    "insufficient disk: {} MiB free, need {} MiB",
                    free_disk / (1024 * 1024),
                    MIN_FREE_DISK_BYTES / (1024 * 1024)
                ));
            }
            if cpu > MAX_CPU_PERCENT {
                issues.push(format!("high CPU usage: {cpu:.0}%"));
            }
            issues
        }
    })
    .await;

    match outcome {
        Ok(issues) if issues.is_empty() => CheckResult::pass("system", "resources ok"),
        Ok(issues) => CheckResult::fail("system", issues.join(", ")),
        Err(err) => CheckResult::fail("system", format!("resource check failed: {err}")),
    }
}

/// Free space on the volume holding the scratch root.
fn scratch_free_space(scratch_root: &Path) -> u64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| scratch_root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .or_else(|| disks.iter().map(|disk| disk.available_space()).max())
        .unwrap_or(u64::MAX)
}

async fn check_audio(
    path: &Path,
    config: &PipelineConfig,
) -> (CheckResult, Option<AudioMetadata>, Option<ProcessingEstimates>) {
    if !path.exists() {
        return (
            CheckResult::fail("audio", format!("file not found: {}", path.display())),
            None,
            None,
        );
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return (
            CheckResult::fail(
                "audio",
                format!("unsupported format .{extension}, supported: {SUPPORTED_EXTENSIONS:?}"),
            ),
            None,
            None,
        );
    }

    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            return (
                CheckResult::fail("audio", format!("cannot stat file: {err}")),
                None,
                None,
            );
        }
    };
    if size == 0 {
        return (CheckResult::fail("audio", "file is empty"), None, None);
    }
    if size > MAX_FILE_BYTES {
        return (
            CheckResult::fail(
                "audio",
                format!("file too large: {} MiB", size / (1024 * 1024)),
            ),
            None,
            None,
        );
    }

    let metadata = match audio::probe(path).await {
        Ok(metadata) => metadata,
        Err(err) => {
            return (CheckResult::fail("audio", err.to_string()), None, None);
        }
    };

    if let Err(detail) = duration_within_bounds(metadata.duration_seconds) {
        return (CheckResult::fail("audio", detail), Some(metadata), None);
    }

    let estimates = estimate_processing(&metadata, config);
    (
        CheckResult::pass(
            "audio",
            format!(
                "{} {:.1} min, {} MiB",
                metadata.codec,
                metadata.duration_seconds / 60.0,
                metadata.size_bytes / (1024 * 1024)
            ),
        ),
        Some(metadata),
        Some(estimates),
    )
}

fn duration_within_bounds(duration_seconds: f64) -> Result<(), String> {
    if duration_seconds < MIN_DURATION_SECONDS {
        return Err(format!(
            "audio too short: {duration_seconds:.1}s < {MIN_DURATION_SECONDS}s"
        ));
    }
    if duration_seconds > MAX_DURATION_SECONDS {
        return Err(format!(
            "audio too long: {:.1}h > {:.0}h",
            duration_seconds / 3600.0,
            MAX_DURATION_SECONDS / 3600.0
        ));
    }
    Ok(())
}

fn estimate_processing(metadata: &AudioMetadata, config: &PipelineConfig) -> ProcessingEstimates {
    let slices = if metadata.size_bytes <= config.max_upload_bytes {
        1
    } else {
        metadata
            .size_bytes
            .div_ceil(config.target_slice_bytes.max(1)) as usize
            + 1
    };
    // Transcription runs at roughly a tenth of real time, plus per-slice
    // extraction and upload overhead.
    let estimated_minutes = metadata.duration_seconds / 60.0 * 0.1 + slices as f64 * 0.5;
    ProcessingEstimates {
        slices,
        api_calls: slices,
        estimated_minutes,
    }
}

async fn check_api(backend: &dyn SpeechBackend) -> CheckResult {
    let Some(api_key) = credentials::lookup_api_key() else {
        return CheckResult::fail(
            "api",
            format!(
                "no API key in keyring or ${}",
                credentials::API_KEY_ENV
            ),
        );
    };
    let client = match get_http_client() {
        Ok(client) => client,
        Err(err) => return CheckResult::fail("api", err.to_string()),
    };
    let request = client
        .get(backend.liveness_url())
        .header("Authorization", format!("Bearer {api_key}"))
        .timeout(LIVENESS_TIMEOUT)
        .send();
    match request.await {
        Ok(response) if response.status().is_success() => {
            CheckResult::pass("api", "service reachable")
        }
        Ok(response) => CheckResult::fail(
            "api",
            format!("liveness check returned {}", response.status()),
        ),
        Err(err) if err.is_timeout() => CheckResult::fail(
            "api",
            format!("liveness check timed out after {}s", LIVENESS_TIMEOUT.as_secs()),
        ),
        Err(err) => CheckResult::fail("api", format!("liveness check failed: {err}")),
    }
}

async fn check_hearing(store: &HearingStore, hearing_id: &str) -> CheckResult {
    match store.hearing(hearing_id) {
        Ok(Some(record)) if record.is_complete() => CheckResult::pass(
            "hearing",
            format!("{} ({}, {})", record.title, record.committee, record.date),
        ),
        Ok(Some(_)) => CheckResult::fail(
            "hearing",
            format!("hearing {hearing_id} is missing title, committee or date"),
        ),
        Ok(None) => CheckResult::fail("hearing", format!("hearing {hearing_id} not found")),
        Err(err) => CheckResult::fail("hearing", format!("store lookup failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::PipelineConfig;

    #[tokio::test]
    async fn missing_audio_fails_before_probing() {
        let config = PipelineConfig::default();
        let (check, metadata, _) = check_audio(Path::new("/nonexistent/hearing.mp3"), &config).await;
        assert!(!check.passed);
        assert!(metadata.is_none());
    }

    #[tokio::test]
    async fn unsupported_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearing.ogg");
        std::fs::write(&path, b"bytes").unwrap();
        let (check, _, _) = check_audio(&path, &PipelineConfig::default()).await;
        assert!(!check.passed);
        assert!(check.detail.contains("unsupported format"));
    }

    #[tokio::test]
    async fn empty_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearing.mp3");
        std::fs::write(&path, b"").unwrap();
        let (check, _, _) = check_audio(&path, &PipelineConfig::default()).await;
        assert!(!check.passed);
        assert!(check.detail.contains("empty"));
    }

    #[test]
    fn duration_bounds() {
        assert!(duration_within_bounds(4.9).is_err());
        assert!(duration_within_bounds(5.0).is_ok());
        assert!(duration_within_bounds(9.9 * 3600.0).is_ok());
        assert!(duration_within_bounds(10.1 * 3600.0).is_err());
    }

    #[tokio::test]
    async fn hearing_check_requires_complete_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = HearingStore::open(&dir.path().join("hearings.sqlite")).unwrap();

        let check = check_hearing(&store, "sh-0").await;
        assert!(!check.passed);

        store.upsert_hearing("sh-1", "Oversight", "Banking", "2025-06-12").unwrap();
        let check = check_hearing(&store, "sh-1").await;
        assert!(check.passed);

        store.upsert_hearing("sh-2", "", "Banking", "2025-06-12").unwrap();
        let check = check_hearing(&store, "sh-2").await;
        assert!(!check.passed);
    }

    #[test]
    fn estimates_scale_with_size() {
        let config = PipelineConfig::default();
        let small = crate::audio::AudioMetadata {
            path: "a.mp3".into(),
            size_bytes: 10 * 1024 * 1024,
            duration_seconds: 600.0,
            codec: "mp3".into(),
            sample_rate_hz: 44_100,
            channels: 2,
            bitrate_bps: None,
        };
        assert_eq!(estimate_processing(&small, &config).slices, 1);

        let large = crate::audio::AudioMetadata {
            size_bytes: 60 * 1024 * 1024,
            ..small
        };
        let estimates = estimate_processing(&large, &config);
        assert!(estimates.slices >= 3);
        assert_eq!(estimates.api_calls, estimates.slices);
    }

    #[test]
    fn report_collects_failures() {
        let report = PreflightReport {
            ready: false,
            readiness_score: 50.0,
            checks: vec![
                CheckResult::pass("system", "ok"),
                CheckResult::fail("audio", "file is empty"),
                CheckResult::pass("hearing", "ok"),
                CheckResult::fail("api", "no API key"),
            ],
            metadata: None,
            estimates: None,
        };
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("audio:"));
    }
}
