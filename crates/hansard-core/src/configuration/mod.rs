//! Pipeline configuration.
//!
//! All knobs recognised by the ingestion pipeline, with their defaults in
//! [`defaults`]. The CLI loads a JSON settings file from the user config
//! directory and applies environment overrides on top; library users can
//! construct a [`PipelineConfig`] directly.

mod defaults;

pub use defaults::*;

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::services::ServiceSet`] and the jobs it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Size beyond which the planner switches from direct to chunked upload.
    pub max_upload_bytes: u64,
    /// Nominal slice size used to estimate the slice count.
    pub target_slice_bytes: u64,
    /// Overlap between consecutive slices, in seconds.
    pub overlap_seconds: f64,
    /// Concurrent slice submissions per job.
    pub max_concurrent_slices: usize,
    /// Token bucket burst capacity for the speech API.
    pub rate_limit_capacity: u32,
    /// Token bucket refill rate, tokens per second.
    pub rate_limit_refill_per_s: f64,
    /// Base directory for leased scratch directories.
    pub scratch_root: PathBuf,
    /// Directory receiving `{job_id}_transcript.json` files.
    pub output_dir: PathBuf,
    /// Directory receiving `{job_id}.json` progress snapshots.
    pub progress_dir: PathBuf,
    /// Path of the hearing metadata database.
    pub db_path: PathBuf,
    /// Process RSS threshold for memory pressure, in MiB.
    pub memory_cap_mb: u64,
    /// Age at which progress snapshot files are pruned, in hours.
    pub retention_hours_progress: u64,
    /// Base URL of the remote speech service.
    pub api_base_url: String,
    /// Per-request timeout for speech API calls, in seconds.
    pub request_timeout_secs: u64,
    /// Optional ISO-639-1 language hint forwarded to the service.
    pub language: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("hansard");
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            target_slice_bytes: DEFAULT_TARGET_SLICE_BYTES,
            overlap_seconds: DEFAULT_OVERLAP_SECONDS,
            max_concurrent_slices: DEFAULT_MAX_CONCURRENT_SLICES,
            rate_limit_capacity: DEFAULT_RATE_LIMIT_CAPACITY,
            rate_limit_refill_per_s: DEFAULT_RATE_LIMIT_REFILL_PER_S,
            scratch_root: std::env::temp_dir(),
            output_dir: data_dir.join("transcripts"),
            progress_dir: data_dir.join("progress"),
            db_path: data_dir.join("hearings.sqlite"),
            memory_cap_mb: DEFAULT_MEMORY_CAP_MB,
            retention_hours_progress: DEFAULT_RETENTION_HOURS_PROGRESS,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            language: None,
        }
    }
}

impl PipelineConfig {
    /// Path of the JSON settings file in the user config directory.
    pub fn settings_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(dir.join("hansard").join("config.json"))
    }

    /// Load settings from disk, falling back to defaults when the file is
    /// absent. A malformed file is an error rather than a silent reset.
    pub fn load() -> Result<Self> {
        let path = Self::settings_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
    }

    /// Persist settings to the user config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Memory cap in bytes.
    pub fn memory_cap_bytes(&self) -> u64 {
        self.memory_cap_mb * 1024 * 1024
    }
}
