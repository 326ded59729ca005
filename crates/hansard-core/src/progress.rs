//! Progress reporting for transcription jobs.
//!
//! Thread-safe aggregation of per-slice state into an overall progress
//! record, published three ways on every update:
//! - an in-memory registry, readable via [`ProgressReporter::snapshot`],
//! - a broadcast channel for live subscribers,
//! - an atomically-replaced JSON snapshot file per job, so an observer (or a
//!   restart) can recover state without the process.
//!
//! `overall_percent` never regresses for a job, whatever order worker updates
//! land in.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transcript::write_json_atomic;
use crate::warn;

/// Pipeline stages, in order. Weights: analyzing 10, slicing 15,
/// transcribing 70, merging 5; cleanup rides between merging and done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    Slicing,
    Transcribing,
    Merging,
    Cleanup,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Percent at which this stage begins.
    fn base_percent(&self) -> u8 {
        match self {
            Stage::Analyzing => 0,
            Stage::Slicing => 10,
            Stage::Transcribing => 25,
            Stage::Merging => 95,
            Stage::Cleanup => 99,
            Stage::Done => 100,
            Stage::Failed => 0,
        }
    }
}

/// Per-slice submission state. Linear forward only, except that `Retrying`
/// may return to `InFlight`; `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SliceState {
    Pending,
    Extracting,
    Queued,
    InFlight,
    Retrying {
        attempt: u32,
        delay_until: DateTime<Utc>,
    },
    Succeeded,
    Failed {
        reason: String,
    },
}

impl SliceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SliceState::Succeeded | SliceState::Failed { .. })
    }

    fn transition_allowed(&self, next: &SliceState) -> bool {
        // Any live slice can fail (errors, cancellation).
        if matches!(next, SliceState::Failed { .. }) {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (SliceState::Pending, SliceState::Extracting)
                // Direct submissions skip extraction entirely.
                | (SliceState::Pending, SliceState::Queued)
                | (SliceState::Extracting, SliceState::Queued)
                | (SliceState::Queued, SliceState::InFlight)
                | (SliceState::InFlight, SliceState::Retrying { .. })
                | (SliceState::InFlight, SliceState::Succeeded)
                | (SliceState::Retrying { .. }, SliceState::InFlight)
        )
    }
}

/// Terminal error surfaced to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressError {
    /// Machine-readable kind, e.g. `auth` or `preflight`.
    pub kind: String,
    /// Short human-readable message.
    pub message: String,
}

/// Snapshot of one job's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub hearing_id: String,
    pub stage: Stage,
    pub overall_percent: u8,
    pub message: String,
    pub per_slice: BTreeMap<usize, SliceState>,
    pub total_slices: Option<usize>,
    pub eta_seconds: Option<u64>,
    pub error: Option<ProgressError>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobProgress {
    record: ProgressRecord,
    in_flight_since: HashMap<usize, Instant>,
    slice_secs: Vec<f64>,
}

/// Aggregates and publishes job progress.
pub struct ProgressReporter {
    progress_dir: PathBuf,
    max_concurrent: usize,
    jobs: Mutex<HashMap<String, JobProgress>>,
    updates: broadcast::Sender<ProgressRecord>,
}

impl ProgressReporter {
    /// Create a reporter writing snapshots under `progress_dir`, pruning
    /// leftovers older than `retention_hours`.
    pub fn new(progress_dir: PathBuf, max_concurrent: usize, retention_hours: u64) -> Result<Self> {
        std::fs::create_dir_all(&progress_dir)
            .with_context(|| format!("failed to create {}", progress_dir.display()))?;
        prune_stale_snapshots(&progress_dir, retention_hours);
        let (updates, _) = broadcast::channel(256);
        Ok(Self {
            progress_dir,
            max_concurrent: max_concurrent.max(1),
            jobs: Mutex::new(HashMap::new()),
            updates,
        })
    }

    /// Begin tracking a job.
    pub fn start(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let record = ProgressRecord {
            hearing_id: job_id.to_string(),
            stage: Stage::Analyzing,
            overall_percent: 0,
            message: "Starting transcription".to_string(),
            per_slice: BTreeMap::new(),
            total_slices: None,
            eta_seconds: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(
            job_id.to_string(),
            JobProgress {
                record: record.clone(),
                in_flight_since: HashMap::new(),
                slice_secs: Vec::new(),
            },
        );
        drop(jobs);
        self.publish(record)
    }

    /// Move a job to `stage` with a status message.
    pub fn set_stage(&self, job_id: &str, stage: Stage, message: impl Into<String>) -> Result<()> {
        self.mutate(job_id, |job| {
            job.record.stage = stage;
            job.record.message = message.into();
        })
    }

    /// Record the slice count once the plan is known.
    pub fn set_total_slices(&self, job_id: &str, total: usize) -> Result<()> {
        self.mutate(job_id, |job| {
            job.record.total_slices = Some(total);
            for index in 0..total {
                job.record.per_slice.entry(index).or_insert(SliceState::Pending);
            }
        })
    }

    /// Replace the slice map after a re-plan changed the slice count.
    pub fn reset_slices(&self, job_id: &str, total: usize) -> Result<()> {
        self.mutate(job_id, |job| {
            job.record.per_slice.clear();
            job.in_flight_since.clear();
            job.record.total_slices = Some(total);
            for index in 0..total {
                job.record.per_slice.insert(index, SliceState::Pending);
            }
        })
    }

    /// Apply a slice state transition. Illegal transitions are dropped with a
    /// warning rather than corrupting the record.
    pub fn slice_state(&self, job_id: &str, index: usize, next: SliceState) -> Result<()> {
        self.mutate(job_id, |job| {
            let current = job
                .record
                .per_slice
                .get(&index)
                .cloned()
                .unwrap_or(SliceState::Pending);
            if !current.transition_allowed(&next) && current != next {
                warn!("slice {index}: dropping illegal transition {current:?} -> {next:?}");
                return;
            }
            match &next {
                SliceState::InFlight => {
                    job.in_flight_since.insert(index, Instant::now());
                }
                SliceState::Succeeded => {
                    if let Some(started) = job.in_flight_since.remove(&index) {
                        job.slice_secs.push(started.elapsed().as_secs_f64());
                    }
                }
                SliceState::Failed { .. } => {
                    job.in_flight_since.remove(&index);
                }
                _ => {}
            }
            job.record.per_slice.insert(index, next);
        })
    }

    /// Mark a job terminal.
    pub fn complete(&self, job_id: &str, ok: bool, error: Option<ProgressError>) -> Result<()> {
        self.mutate(job_id, |job| {
            job.record.stage = if ok { Stage::Done } else { Stage::Failed };
            job.record.completed_at = Some(Utc::now());
            job.record.eta_seconds = None;
            job.record.error = error;
            job.record.message = if ok {
                "Transcription complete".to_string()
            } else {
                job.record
                    .error
                    .as_ref()
                    .map(|err| err.message.clone())
                    .unwrap_or_else(|| "Transcription failed".to_string())
            };
        })
    }

    /// Copy of the current record for a job.
    pub fn snapshot(&self, job_id: &str) -> Option<ProgressRecord> {
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .map(|job| job.record.clone())
    }

    /// Subscribe to every published record.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressRecord> {
        self.updates.subscribe()
    }

    /// Forget a job and remove its snapshot file.
    pub fn clear(&self, job_id: &str) {
        self.jobs.lock().unwrap().remove(job_id);
        let _ = std::fs::remove_file(self.snapshot_path(job_id));
    }

    /// Snapshot file for a job.
    pub fn snapshot_path(&self, job_id: &str) -> PathBuf {
        self.progress_dir.join(format!("{job_id}.json"))
    }

    fn mutate(&self, job_id: &str, apply: impl FnOnce(&mut JobProgress)) -> Result<()> {
        let record = {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .get_mut(job_id)
                .with_context(|| format!("no progress record for job {job_id}"))?;
            apply(job);
            job.record.updated_at = Utc::now();
            Self::recompute(job, self.max_concurrent);
            job.record.clone()
        };
        self.publish(record)
    }

    /// Recompute percent (monotonic) and ETA from the slice map.
    fn recompute(job: &mut JobProgress, max_concurrent: usize) {
        let record = &mut job.record;
        let percent = match record.stage {
            Stage::Transcribing => {
                let total = record.total_slices.unwrap_or(0);
                if total == 0 {
                    Stage::Transcribing.base_percent()
                } else {
                    let completed = record
                        .per_slice
                        .values()
                        .filter(|state| matches!(state, SliceState::Succeeded))
                        .count() as f64;
                    let in_flight = record
                        .per_slice
                        .values()
                        .filter(|state| {
                            matches!(state, SliceState::InFlight | SliceState::Retrying { .. })
                        })
                        .count() as f64;
                    let share = (completed + 0.5 * in_flight) / total as f64;
                    25 + (70.0 * share).round() as u8
                }
            }
            Stage::Failed => record.overall_percent,
            stage => stage.base_percent(),
        };
        record.overall_percent = record.overall_percent.max(percent.min(100));

        record.eta_seconds = if record.stage == Stage::Transcribing && job.slice_secs.len() >= 2 {
            let total = record.total_slices.unwrap_or(0);
            let done = record
                .per_slice
                .values()
                .filter(|state| state.is_terminal())
                .count();
            let remaining = total.saturating_sub(done);
            if remaining > 0 {
                let avg = job.slice_secs.iter().sum::<f64>() / job.slice_secs.len() as f64;
                let lanes = max_concurrent.min(remaining) as f64;
                Some((avg * remaining as f64 / lanes).round() as u64)
            } else {
                None
            }
        } else {
            None
        };
    }

    fn publish(&self, record: ProgressRecord) -> Result<()> {
        // No subscribers is fine; the registry and snapshot still serve reads.
        let _ = self.updates.send(record.clone());
        write_json_atomic(&self.snapshot_path(&record.hearing_id), &record)
            .context("failed to write progress snapshot")
    }
}

/// Delete snapshot files older than the retention window.
fn prune_stale_snapshots(dir: &std::path::Path, retention_hours: u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_hours * 3600);
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if stale {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> (tempfile::TempDir, ProgressReporter) {
        let dir = tempfile::tempdir().unwrap();
        let reporter = ProgressReporter::new(dir.path().to_path_buf(), 3, 24).unwrap();
        (dir, reporter)
    }

    #[test]
    fn percent_is_monotonic_across_stages() {
        let (_dir, reporter) = reporter();
        reporter.start("job").unwrap();
        let mut last = 0;
        for (stage, message) in [
            (Stage::Analyzing, "analyzing"),
            (Stage::Slicing, "slicing"),
            (Stage::Transcribing, "transcribing"),
            (Stage::Merging, "merging"),
            (Stage::Cleanup, "cleanup"),
        ] {
            reporter.set_stage("job", stage, message).unwrap();
            let percent = reporter.snapshot("job").unwrap().overall_percent;
            assert!(percent >= last, "{stage:?} regressed {last} -> {percent}");
            last = percent;
        }
        reporter.complete("job", true, None).unwrap();
        assert_eq!(reporter.snapshot("job").unwrap().overall_percent, 100);
    }

    #[test]
    fn transcribing_percent_prorates_by_slice_states() {
        let (_dir, reporter) = reporter();
        reporter.start("job").unwrap();
        reporter.set_total_slices("job", 4).unwrap();
        reporter
            .set_stage("job", Stage::Transcribing, "transcribing")
            .unwrap();
        assert_eq!(reporter.snapshot("job").unwrap().overall_percent, 25);

        for index in [0, 1] {
            reporter
                .slice_state("job", index, SliceState::Extracting)
                .unwrap();
            reporter.slice_state("job", index, SliceState::Queued).unwrap();
            reporter
                .slice_state("job", index, SliceState::InFlight)
                .unwrap();
        }
        // Two of four in flight: 25 + 70 * (0 + 0.5*2)/4 ≈ 43.
        assert_eq!(reporter.snapshot("job").unwrap().overall_percent, 43);

        reporter.slice_state("job", 0, SliceState::Succeeded).unwrap();
        // 25 + 70 * (1 + 0.5)/4 ≈ 51.
        assert_eq!(reporter.snapshot("job").unwrap().overall_percent, 51);
    }

    #[test]
    fn illegal_slice_transitions_are_dropped() {
        let (_dir, reporter) = reporter();
        reporter.start("job").unwrap();
        reporter.set_total_slices("job", 1).unwrap();
        // Pending cannot jump straight to InFlight.
        reporter.slice_state("job", 0, SliceState::InFlight).unwrap();
        assert_eq!(
            reporter.snapshot("job").unwrap().per_slice[&0],
            SliceState::Pending
        );
        // Terminal states never change.
        reporter.slice_state("job", 0, SliceState::Extracting).unwrap();
        reporter
            .slice_state(
                "job",
                0,
                SliceState::Failed {
                    reason: "cancelled".to_string(),
                },
            )
            .unwrap();
        reporter.slice_state("job", 0, SliceState::Succeeded).unwrap();
        assert!(matches!(
            reporter.snapshot("job").unwrap().per_slice[&0],
            SliceState::Failed { .. }
        ));
    }

    #[test]
    fn retrying_returns_to_in_flight() {
        let (_dir, reporter) = reporter();
        reporter.start("job").unwrap();
        reporter.set_total_slices("job", 1).unwrap();
        for state in [
            SliceState::Extracting,
            SliceState::Queued,
            SliceState::InFlight,
            SliceState::Retrying {
                attempt: 1,
                delay_until: Utc::now(),
            },
            SliceState::InFlight,
            SliceState::Succeeded,
        ] {
            reporter.slice_state("job", 0, state.clone()).unwrap();
            assert_eq!(reporter.snapshot("job").unwrap().per_slice[&0], state);
        }
    }

    #[test]
    fn snapshot_file_tracks_updates_atomically() {
        let (dir, reporter) = reporter();
        reporter.start("job").unwrap();
        reporter.set_stage("job", Stage::Slicing, "slicing").unwrap();

        let path = dir.path().join("job.json");
        let raw = std::fs::read_to_string(&path).unwrap();
        let record: ProgressRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.stage, Stage::Slicing);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn subscribers_see_published_updates() {
        let (_dir, reporter) = reporter();
        let mut updates = reporter.subscribe();
        reporter.start("job").unwrap();
        let record = updates.try_recv().unwrap();
        assert_eq!(record.hearing_id, "job");
        assert_eq!(record.stage, Stage::Analyzing);
    }

    #[test]
    fn failed_jobs_keep_their_error() {
        let (_dir, reporter) = reporter();
        reporter.start("job").unwrap();
        reporter
            .complete(
                "job",
                false,
                Some(ProgressError {
                    kind: "auth".to_string(),
                    message: "authentication rejected".to_string(),
                }),
            )
            .unwrap();
        let record = reporter.snapshot("job").unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, "auth");
        assert!(record.completed_at.is_some());
    }
}
