//! The transcription pipeline.
//!
//! One job runs the state machine
//! `Created -> Validating -> Planning -> (Direct | Slicing) -> Submitting ->
//! Merging -> Persisting -> Done`, with `Failed` reachable from any
//! non-terminal state and `Cancelled` from the slicing/submitting phases.
//! Exactly one scratch directory is leased per job and released on every
//! exit path; no transcript exists until it has been persisted and the store
//! row updated.

mod merge;
mod submit;

pub use merge::{merge_slices, MergedTranscript, OVERLAP_TOLERANCE_SECS};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::audio::{self, Plan, PlannerConfig, SliceSpec, MAX_REPLANS};
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::configuration::PipelineConfig;
use crate::credentials;
use crate::error::{HansardError, Result};
use crate::limiter::TokenBucket;
use crate::preflight;
use crate::progress::{ProgressError, ProgressRecord, ProgressReporter, Stage};
use crate::provider::{RetryPolicy, SpeechBackend};
use crate::resources::{CleanupScheduler, ResourcePool};
use crate::store::HearingStore;
use crate::transcript::{
    write_json_atomic, write_transcript, ProcessingMethod, Transcript, TranscriptMetadata,
};
use crate::{info, verbose, warn};

use submit::{submit_direct, submit_slices, SubmitContext, SubmitOutcome};

/// Caller-facing submission options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Submit slices concurrently. When off, slices still flow through the
    /// same machinery one at a time.
    pub prefer_parallel: bool,
    /// Skip the preflight gate. The pipeline still probes the file.
    pub skip_preflight: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            prefer_parallel: true,
            skip_preflight: false,
        }
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Validating,
    Planning,
    Slicing,
    Submitting,
    Merging,
    Persisting,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// Legal forward transitions.
    pub fn can_transition(&self, next: JobState) -> bool {
        match next {
            JobState::Failed => !self.is_terminal(),
            JobState::Cancelled => matches!(self, JobState::Slicing | JobState::Submitting),
            _ => matches!(
                (self, next),
                (JobState::Created, JobState::Validating)
                    | (JobState::Validating, JobState::Planning)
                    | (JobState::Planning, JobState::Slicing)
                    | (JobState::Planning, JobState::Submitting)
                    | (JobState::Slicing, JobState::Submitting)
                    // A re-plan sends oversized slices back to extraction.
                    | (JobState::Submitting, JobState::Slicing)
                    | (JobState::Submitting, JobState::Merging)
                    | (JobState::Merging, JobState::Persisting)
                    | (JobState::Persisting, JobState::Done)
            ),
        }
    }

    /// Observer-facing stage for this state.
    fn stage(&self) -> Stage {
        match self {
            JobState::Created | JobState::Validating | JobState::Planning => Stage::Analyzing,
            JobState::Slicing => Stage::Slicing,
            JobState::Submitting => Stage::Transcribing,
            JobState::Merging | JobState::Persisting => Stage::Merging,
            JobState::Done => Stage::Done,
            JobState::Failed | JobState::Cancelled => Stage::Failed,
        }
    }
}

/// Everything a job borrows from the process-wide service set.
pub(crate) struct JobEnv {
    pub config: PipelineConfig,
    pub limiter: Arc<TokenBucket>,
    pub pool: Arc<ResourcePool>,
    pub reporter: Arc<ProgressReporter>,
    pub cleanup: Arc<CleanupScheduler>,
    pub store: Arc<HearingStore>,
    pub backend: Arc<dyn SpeechBackend>,
    pub retry: RetryPolicy,
}

/// Handle to a running job.
pub struct JobHandle {
    job_id: String,
    cancel: CancelHandle,
    join: tokio::task::JoinHandle<Result<Transcript>>,
    reporter: Arc<ProgressReporter>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Request cancellation; outstanding work stops at its next suspension
    /// point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Option<ProgressRecord> {
        self.reporter.snapshot(&self.job_id)
    }

    /// Wait for the job's terminal outcome. Takes `&mut self` so a caller can
    /// race it against a cancel signal and then await again.
    pub async fn await_result(&mut self) -> Result<Transcript> {
        match (&mut self.join).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(HansardError::MergeInvariantViolated(format!(
                "job task panicked: {join_err}"
            ))),
        }
    }
}

/// Spawn a job and hand back its handle.
pub(crate) fn spawn_job(
    env: JobEnv,
    job_id: String,
    audio_path: PathBuf,
    options: SubmitOptions,
) -> JobHandle {
    let (cancel, token) = cancel_pair();
    let reporter = Arc::clone(&env.reporter);
    let id = job_id.clone();
    let join = tokio::spawn(run_job(env, job_id.clone(), audio_path, options, token));
    JobHandle {
        job_id: id,
        cancel,
        join,
        reporter,
    }
}

/// Drive one job to a terminal state, reporting progress throughout.
async fn run_job(
    env: JobEnv,
    job_id: String,
    audio_path: PathBuf,
    options: SubmitOptions,
    cancel: CancelToken,
) -> Result<Transcript> {
    env.reporter.start(&job_id).map_err(|err| persistence("progress", err))?;

    let outcome = run_job_inner(&env, &job_id, &audio_path, &options, &cancel).await;

    match &outcome {
        Ok(_) => {
            env.reporter
                .complete(&job_id, true, None)
                .map_err(|err| persistence("progress", err))?;
            info!("job {job_id}: transcription complete");
        }
        Err(err) => {
            let _ = env.reporter.complete(
                &job_id,
                false,
                Some(ProgressError {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }),
            );
            if err.is_cancelled() {
                info!("job {job_id}: cancelled");
            } else {
                warn!("job {job_id}: failed: {err}");
            }
        }
    }
    outcome
}

async fn run_job_inner(
    env: &JobEnv,
    job_id: &str,
    audio_path: &std::path::Path,
    options: &SubmitOptions,
    cancel: &CancelToken,
) -> Result<Transcript> {
    let mut state = JobState::Created;

    // Validating: the synchronous gate before any work starts.
    advance(env, job_id, &mut state, JobState::Validating, "Validating inputs")?;
    let metadata = if options.skip_preflight {
        audio::probe(audio_path).await?
    } else {
        let report =
            preflight::run_preflight(audio_path, job_id, &env.config, &env.store, env.backend.as_ref())
                .await;
        if !report.ready {
            return Err(HansardError::PreflightFailed {
                items: report.failures(),
            });
        }
        match report.metadata {
            Some(metadata) => metadata,
            None => audio::probe(audio_path).await?,
        }
    };
    if cancel.is_cancelled() {
        return Err(HansardError::Cancelled);
    }

    advance(env, job_id, &mut state, JobState::Planning, "Planning submission")?;
    let api_key = credentials::lookup_api_key().ok_or_else(|| HansardError::PreflightFailed {
        items: vec![format!(
            "api: no API key in keyring or ${}",
            credentials::API_KEY_ENV
        )],
    })?;
    // Context prompt from the hearing record; the service reads at most 224
    // tokens of it.
    let prompt = env
        .store
        .hearing(job_id)
        .ok()
        .flatten()
        .map(|record| format!("This is a transcript of a legislative hearing: {}", record.title));

    let base_planner = PlannerConfig {
        max_upload_bytes: env.config.max_upload_bytes,
        target_slice_bytes: env.config.target_slice_bytes,
        overlap_seconds: env.config.overlap_seconds,
    };
    let concurrency = if options.prefer_parallel {
        env.config.max_concurrent_slices
    } else {
        1
    };

    // One scratch directory per job, whatever happens. The lease's drop
    // guard covers error and cancellation paths; the explicit release below
    // covers the happy path.
    let scratch = env.pool.lease().map_err(|err| persistence("scratch", err))?;

    let mut replans = 0u32;
    let (results, specs, method) = loop {
        let planner = base_planner.shrunk(replans);
        let plan = audio::plan(&metadata, &planner)?;

        match plan {
            Plan::Direct => {
                advance(env, job_id, &mut state, JobState::Submitting, "Uploading audio")?;
                env.reporter
                    .set_total_slices(job_id, 1)
                    .map_err(|err| persistence("progress", err))?;
                let spec = SliceSpec {
                    index: 0,
                    start_s: 0.0,
                    duration_s: metadata.duration_seconds,
                    overlap_head_s: 0.0,
                    overlap_tail_s: 0.0,
                };
                let result = submit_direct(
                    submit_context(env, job_id, audio_path, &api_key, &prompt, cancel),
                    metadata.duration_seconds,
                )
                .await?;
                break (vec![result], vec![spec], ProcessingMethod::Direct);
            }
            Plan::Chunked(plan) => {
                advance(
                    env,
                    job_id,
                    &mut state,
                    JobState::Slicing,
                    format!("Extracting {} slices", plan.slices.len()),
                )?;
                env.reporter
                    .reset_slices(job_id, plan.slices.len())
                    .map_err(|err| persistence("progress", err))?;

                // Plan sidecar for post-mortems; informational only.
                if let Err(err) = write_json_atomic(&scratch.path().join("plan.json"), &plan) {
                    warn!("job {job_id}: could not write plan sidecar: {err}");
                }

                advance(
                    env,
                    job_id,
                    &mut state,
                    JobState::Submitting,
                    format!("Transcribing {} slices", plan.slices.len()),
                )?;
                let outcome = submit_slices(
                    submit_context(env, job_id, audio_path, &api_key, &prompt, cancel),
                    &plan,
                    scratch.path(),
                    concurrency,
                    replans,
                )
                .await?;

                match outcome {
                    SubmitOutcome::Completed(results) => {
                        break (results, plan.slices, ProcessingMethod::Chunked);
                    }
                    SubmitOutcome::Oversized { index, bytes } => {
                        replans += 1;
                        if replans > MAX_REPLANS {
                            return Err(HansardError::PlanInfeasible { replans });
                        }
                        warn!(
                            "job {job_id}: slice {index} came out at {bytes} bytes, \
                             re-planning ({replans}/{MAX_REPLANS})"
                        );
                        continue;
                    }
                }
            }
        }
    };

    advance(
        env,
        job_id,
        &mut state,
        JobState::Merging,
        format!("Merging {} slice transcripts", results.len()),
    )?;
    let merged = merge_slices(&results, &specs)?;
    verbose!(
        "job {job_id}: merged {} segments spanning {:.1}s",
        merged.segments.len(),
        merged.duration_s
    );
    let transcript = Transcript {
        text: merged.text,
        segments: merged.segments,
        duration_s: merged.duration_s,
        language: merged.language,
        metadata: TranscriptMetadata {
            method,
            chunks: specs.len(),
            produced_at: Utc::now(),
            source_path: audio_path.to_path_buf(),
        },
    };

    advance(env, job_id, &mut state, JobState::Persisting, "Persisting transcript")?;
    let path = write_transcript(&env.config.output_dir, job_id, &transcript).map_err(|err| {
        HansardError::PersistenceFailed {
            target: "transcript".to_string(),
            cause: err.to_string(),
        }
    })?;
    env.store
        .mark_transcribed(job_id, &transcript.text)
        .map_err(|err| persistence("store", err))?;
    verbose!("job {job_id}: transcript at {}", path.display());

    // Cleanup before the terminal state so observers see the scratch space
    // released.
    env.reporter
        .set_stage(job_id, Stage::Cleanup, "Releasing scratch space")
        .map_err(|err| persistence("progress", err))?;
    scratch.release();

    advance(env, job_id, &mut state, JobState::Done, "Done")?;
    Ok(transcript)
}

fn submit_context(
    env: &JobEnv,
    job_id: &str,
    audio_path: &std::path::Path,
    api_key: &str,
    prompt: &Option<String>,
    cancel: &CancelToken,
) -> SubmitContext {
    SubmitContext {
        job_id: job_id.to_string(),
        source: audio_path.to_path_buf(),
        config: env.config.clone(),
        limiter: Arc::clone(&env.limiter),
        reporter: Arc::clone(&env.reporter),
        cleanup: Arc::clone(&env.cleanup),
        backend: Arc::clone(&env.backend),
        retry: env.retry.clone(),
        api_key: api_key.to_string(),
        language: env.config.language.clone(),
        prompt: prompt.clone(),
        cancel: cancel.clone(),
    }
}

/// Move the state machine forward and mirror it into the progress record.
fn advance(
    env: &JobEnv,
    job_id: &str,
    state: &mut JobState,
    next: JobState,
    message: impl Into<String>,
) -> Result<()> {
    if !state.can_transition(next) {
        warn!("job {job_id}: unexpected transition {state:?} -> {next:?}");
    }
    *state = next;
    // Done/Failed stages are published by `complete`, not here.
    if !next.is_terminal() {
        env.reporter
            .set_stage(job_id, next.stage(), message)
            .map_err(|err| persistence("progress", err))?;
    }
    Ok(())
}

fn persistence(target: &str, err: anyhow::Error) -> HansardError {
    HansardError::PersistenceFailed {
        target: target.to_string(),
        cause: err.to_string(),
    }
}
