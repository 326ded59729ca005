//! Final transcript types and persistence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the transcript was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMethod {
    Direct,
    Chunked,
}

/// One time-aligned utterance on the source timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
}

/// Provenance recorded alongside the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    pub method: ProcessingMethod,
    pub chunks: usize,
    pub produced_at: DateTime<Utc>,
    pub source_path: PathBuf,
}

/// The merged, time-aligned transcript of one hearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
    pub duration_s: f64,
    pub language: String,
    pub metadata: TranscriptMetadata,
}

impl Transcript {
    /// Snapshot path for a job under `output_dir`.
    pub fn output_path(output_dir: &Path, job_id: &str) -> PathBuf {
        output_dir.join(format!("{job_id}_transcript.json"))
    }
}

/// Serialize `value` to `path` atomically: write a sibling temp file, then
/// rename over the target. Readers never observe a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("destination path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
    Ok(())
}

/// Persist a transcript for `job_id` into `output_dir`, atomically.
pub fn write_transcript(output_dir: &Path, job_id: &str, transcript: &Transcript) -> Result<PathBuf> {
    let path = Transcript::output_path(output_dir, job_id);
    write_json_atomic(&path, transcript)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transcript {
        Transcript {
            text: "The committee will come to order.".to_string(),
            segments: vec![Segment {
                id: 0,
                start_s: 0.0,
                end_s: 4.2,
                text: "The committee will come to order.".to_string(),
            }],
            duration_s: 4.2,
            language: "en".to_string(),
            metadata: TranscriptMetadata {
                method: ProcessingMethod::Direct,
                chunks: 1,
                produced_at: Utc::now(),
                source_path: PathBuf::from("hearing.mp3"),
            },
        }
    }

    #[test]
    fn transcript_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(dir.path(), "sh-117-42", &sample()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sh-117-42_transcript.json");

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Transcript = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.metadata.chunks, 1);

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn method_serializes_lowercase() {
        let raw = serde_json::to_string(&ProcessingMethod::Chunked).unwrap();
        assert_eq!(raw, r#""chunked""#);
    }
}
