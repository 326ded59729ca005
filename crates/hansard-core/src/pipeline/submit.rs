//! Parallel slice submission.
//!
//! Every planned slice runs the same worker: extract, verify size, wait for
//! a rate-limit token, submit, and classify failures through the retry
//! policy. Workers are spawned eagerly and throttled by a semaphore, so at
//! most `max_concurrent_slices` slices are extracting or in flight at once.
//! The first terminal failure aborts the siblings at their next suspension
//! point; cancellation from the caller behaves the same way but wins the
//! tie.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::audio::{self, SlicePlan, SliceSpec};
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::configuration::PipelineConfig;
use crate::error::HansardError;
use crate::limiter::TokenBucket;
use crate::progress::{ProgressReporter, SliceState};
use crate::provider::{
    RetryClass, RetryDecision, RetryLog, RetryPolicy, SliceTranscription, SpeechBackend,
    TranscriptionRequest,
};
use crate::resources::{CleanupPolicy, CleanupScheduler};
use crate::verbose;

/// Everything a slice worker needs, shared across the job.
pub(crate) struct SubmitContext {
    pub job_id: String,
    pub source: PathBuf,
    pub config: PipelineConfig,
    pub limiter: Arc<TokenBucket>,
    pub reporter: Arc<ProgressReporter>,
    pub cleanup: Arc<CleanupScheduler>,
    pub backend: Arc<dyn SpeechBackend>,
    pub retry: RetryPolicy,
    pub api_key: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub cancel: CancelToken,
}

/// Result of submitting a whole plan.
pub(crate) enum SubmitOutcome {
    /// Every slice succeeded, results ordered by slice index.
    Completed(Vec<SliceTranscription>),
    /// An extracted slice outgrew the upload limit; the plan must shrink.
    Oversized { index: usize, bytes: u64 },
}

/// Why one worker stopped. The job-level error itself is recorded in
/// [`SharedState::first_error`] at the point of failure.
enum WorkerFailure {
    Fatal,
    Oversized { index: usize, bytes: u64 },
    Cancelled,
    /// A sibling already failed; this worker just stood down.
    Aborted,
}

struct SharedState {
    ctx: SubmitContext,
    abort: CancelHandle,
    abort_token: CancelToken,
    first_error: Mutex<Option<HansardError>>,
    oversized: Mutex<Option<(usize, u64)>>,
}

/// Submit every slice of a chunked plan.
///
/// `generation` is the re-plan counter; it namespaces slice file names so a
/// re-plan never collides with files the cleanup scheduler is still about to
/// delete from the previous attempt.
pub(crate) async fn submit_slices(
    ctx: SubmitContext,
    plan: &SlicePlan,
    scratch: &Path,
    concurrency: usize,
    generation: u32,
) -> Result<SubmitOutcome, HansardError> {
    let (abort, abort_token) = cancel_pair();
    let shared = Arc::new(SharedState {
        ctx,
        abort,
        abort_token,
        first_error: Mutex::new(None),
        oversized: Mutex::new(None),
    });

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(plan.slices.len());
    for spec in &plan.slices {
        let shared = Arc::clone(&shared);
        let semaphore = Arc::clone(&semaphore);
        let spec = spec.clone();
        let slice_path = scratch.join(slice_file_name(&shared.ctx.source, generation, spec.index));
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (spec.index, Err(WorkerFailure::Aborted));
            };
            let outcome = run_slice(&shared, &spec, &slice_path).await;
            if let Err(failure) = &outcome {
                shared.note_failure(failure);
            }
            (spec.index, outcome)
        }));
    }

    let mut results: Vec<Option<SliceTranscription>> = Vec::new();
    results.resize_with(plan.slices.len(), || None);
    for handle in handles {
        match handle.await {
            Ok((index, Ok(result))) => results[index] = Some(result),
            Ok((_, Err(_))) => {}
            Err(join_err) => {
                shared.record_first_error(HansardError::MergeInvariantViolated(format!(
                    "slice worker panicked: {join_err}"
                )));
            }
        }
    }

    if let Some((index, bytes)) = *shared.oversized.lock().unwrap() {
        return Ok(SubmitOutcome::Oversized { index, bytes });
    }
    if let Some(err) = shared.first_error.lock().unwrap().take() {
        return Err(err);
    }
    if shared.ctx.cancel.is_cancelled() {
        return Err(HansardError::Cancelled);
    }

    let results: Option<Vec<SliceTranscription>> = results.into_iter().collect();
    results
        .map(SubmitOutcome::Completed)
        .ok_or_else(|| {
            HansardError::MergeInvariantViolated("a slice finished without a result".to_string())
        })
}

/// Submit the whole file as a single request (direct plan).
pub(crate) async fn submit_direct(
    ctx: SubmitContext,
    duration_s: f64,
) -> Result<SliceTranscription, HansardError> {
    let (abort, abort_token) = cancel_pair();
    let shared = Arc::new(SharedState {
        ctx,
        abort,
        abort_token,
        first_error: Mutex::new(None),
        oversized: Mutex::new(None),
    });
    let spec = SliceSpec {
        index: 0,
        start_s: 0.0,
        duration_s,
        overlap_head_s: 0.0,
        overlap_tail_s: 0.0,
    };
    let source = shared.ctx.source.clone();
    let outcome = transcribe_slice(&shared, &spec, &source, false).await;
    mark_if_interrupted(&shared, spec.index, &outcome);
    match outcome {
        Ok(result) => Ok(result),
        Err(_) => Err(shared
            .first_error
            .lock()
            .unwrap()
            .take()
            .unwrap_or(HansardError::Cancelled)),
    }
}

impl SharedState {
    fn record_first_error(&self, err: HansardError) {
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.abort.cancel();
    }

    fn note_failure(&self, failure: &WorkerFailure) {
        if let WorkerFailure::Oversized { index, bytes } = failure {
            let mut slot = self.oversized.lock().unwrap();
            if slot.is_none() {
                *slot = Some((*index, *bytes));
            }
            drop(slot);
            self.abort.cancel();
        }
    }
}

/// One slice, end to end.
async fn run_slice(
    shared: &Arc<SharedState>,
    spec: &SliceSpec,
    slice_path: &Path,
) -> Result<SliceTranscription, WorkerFailure> {
    let outcome = transcribe_slice(shared, spec, slice_path, true).await;
    mark_if_interrupted(shared, spec.index, &outcome);
    // Whatever happened, the slice file is done with; hand it to the
    // cleanup scheduler rather than deleting inline.
    if slice_path.exists() {
        shared
            .ctx
            .cleanup
            .schedule(slice_path, CleanupPolicy::Immediate);
    }
    outcome
}

/// A worker stopped by cancellation or a sibling's failure leaves its slice
/// in `failed(cancelled)`.
fn mark_if_interrupted(
    shared: &Arc<SharedState>,
    index: usize,
    outcome: &Result<SliceTranscription, WorkerFailure>,
) {
    if matches!(
        outcome,
        Err(WorkerFailure::Cancelled | WorkerFailure::Aborted)
    ) {
        let _ = shared.ctx.reporter.slice_state(
            &shared.ctx.job_id,
            index,
            SliceState::Failed {
                reason: "cancelled".to_string(),
            },
        );
    }
}

async fn transcribe_slice(
    shared: &Arc<SharedState>,
    spec: &SliceSpec,
    slice_path: &Path,
    extract: bool,
) -> Result<SliceTranscription, WorkerFailure> {
    let ctx = &shared.ctx;
    let mut retry_log = RetryLog::new();

    if extract {
        report(shared, spec.index, SliceState::Extracting)?;
        extract_with_retry(shared, spec, slice_path, &mut retry_log).await?;

        let bytes = std::fs::metadata(slice_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if bytes > ctx.config.max_upload_bytes {
            return Err(WorkerFailure::Oversized {
                index: spec.index,
                bytes,
            });
        }
    }

    report(shared, spec.index, SliceState::Queued)?;
    checked(shared, ctx.limiter.acquire(1)).await?;

    loop {
        report(shared, spec.index, SliceState::InFlight)?;
        let audio_data = checked(shared, tokio::fs::read(slice_path))
            .await?
            .map_err(|err| {
                fatal(
                    shared,
                    HansardError::SliceExtractionFailed {
                        index: spec.index,
                        source: audio::AudioError::Io(err),
                    },
                )
            })?;

        let request = TranscriptionRequest {
            audio_data,
            filename: slice_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "audio.mp3".to_string()),
            mime_type: mime_for(slice_path).to_string(),
            language: ctx.language.clone(),
            prompt: ctx.prompt.clone(),
        };

        let client = crate::http::get_http_client().map_err(|err| {
            fatal(
                shared,
                HansardError::PersistenceFailed {
                    target: "http client".to_string(),
                    cause: err.to_string(),
                },
            )
        })?;

        let response = checked(
            shared,
            ctx.backend.transcribe(client, &ctx.api_key, request),
        )
        .await?;

        match response {
            Ok(result) => {
                report(shared, spec.index, SliceState::Succeeded)?;
                verbose!("slice {} transcribed ({} segments)", spec.index, result.segments.len());
                return Ok(result);
            }
            Err(api_err) => {
                let Some(class) = api_err.retry_class() else {
                    report(
                        shared,
                        spec.index,
                        SliceState::Failed {
                            reason: api_err.kind().to_string(),
                        },
                    )?;
                    return Err(fatal(
                        shared,
                        HansardError::TranscriptionRejected {
                            index: spec.index,
                            source: api_err,
                        },
                    ));
                };
                match ctx.retry.decide(&mut retry_log, class) {
                    RetryDecision::GiveUp { attempts } => {
                        report(
                            shared,
                            spec.index,
                            SliceState::Failed {
                                reason: api_err.kind().to_string(),
                            },
                        )?;
                        return Err(fatal(
                            shared,
                            HansardError::TranscriptionFailed {
                                index: spec.index,
                                attempts,
                                source: api_err,
                            },
                        ));
                    }
                    RetryDecision::Retry { delay, attempt } => {
                        report(
                            shared,
                            spec.index,
                            SliceState::Retrying {
                                attempt,
                                delay_until: Utc::now()
                                    + chrono::Duration::from_std(delay)
                                        .unwrap_or_else(|_| chrono::Duration::zero()),
                            },
                        )?;
                        verbose!(
                            "slice {}: {} -> retry {attempt} in {:.1}s",
                            spec.index,
                            api_err.kind(),
                            delay.as_secs_f64()
                        );
                        if delay > Duration::ZERO {
                            checked(shared, tokio::time::sleep(delay)).await?;
                        }
                    }
                }
            }
        }
    }
}

/// Extract the slice, retrying once through the chunk-corruption budget.
async fn extract_with_retry(
    shared: &Arc<SharedState>,
    spec: &SliceSpec,
    slice_path: &Path,
    retry_log: &mut RetryLog,
) -> Result<(), WorkerFailure> {
    loop {
        let outcome = checked(
            shared,
            audio::extract_slice(&shared.ctx.source, spec.start_s, spec.duration_s, slice_path),
        )
        .await?;
        match outcome {
            Ok(()) => return Ok(()),
            Err(err) => {
                match shared.ctx.retry.decide(retry_log, RetryClass::ChunkCorruption) {
                    RetryDecision::Retry { .. } => {
                        verbose!("slice {}: re-extracting after {err}", spec.index);
                        continue;
                    }
                    RetryDecision::GiveUp { .. } => {
                        report(
                            shared,
                            spec.index,
                            SliceState::Failed {
                                reason: "extraction".to_string(),
                            },
                        )?;
                        return Err(fatal(
                            shared,
                            HansardError::SliceExtractionFailed {
                                index: spec.index,
                                source: err,
                            },
                        ));
                    }
                }
            }
        }
    }
}

/// Await `future` unless the job is cancelled or a sibling aborted first.
async fn checked<F: Future>(
    shared: &Arc<SharedState>,
    future: F,
) -> Result<F::Output, WorkerFailure> {
    tokio::select! {
        biased;
        _ = shared.ctx.cancel.cancelled() => Err(WorkerFailure::Cancelled),
        _ = shared.abort_token.cancelled() => Err(WorkerFailure::Aborted),
        output = future => Ok(output),
    }
}

/// Record a fatal error for the job and return the matching worker failure.
fn fatal(shared: &Arc<SharedState>, err: HansardError) -> WorkerFailure {
    shared.record_first_error(err);
    WorkerFailure::Fatal
}

/// Report a slice state; reporter failures are fatal for the job.
fn report(
    shared: &Arc<SharedState>,
    index: usize,
    state: SliceState,
) -> Result<(), WorkerFailure> {
    // Cancellation surfaces as a failed(cancelled) slice state.
    if shared.ctx.cancel.is_cancelled() && !state.is_terminal() {
        let _ = shared.ctx.reporter.slice_state(
            &shared.ctx.job_id,
            index,
            SliceState::Failed {
                reason: "cancelled".to_string(),
            },
        );
        return Err(WorkerFailure::Cancelled);
    }
    shared
        .ctx
        .reporter
        .slice_state(&shared.ctx.job_id, index, state)
        .map_err(|err| {
            fatal(
                shared,
                HansardError::PersistenceFailed {
                    target: "progress".to_string(),
                    cause: err.to_string(),
                },
            )
        })
}

/// Slice file name, preserving the source container extension.
fn slice_file_name(source: &Path, generation: u32, index: usize) -> String {
    let ext = source
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp3");
    format!("slice_{generation}_{index:03}.{ext}")
}

/// Content type for the multipart upload.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        _ => "audio/mpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use crate::error::ApiError;
    use crate::progress::Stage;
    use crate::resources::MemoryMonitor;

    #[test]
    fn slice_names_keep_the_container_and_generation() {
        assert_eq!(
            slice_file_name(Path::new("hearing.mp3"), 0, 0),
            "slice_0_000.mp3"
        );
        assert_eq!(
            slice_file_name(Path::new("hearing.wav"), 1, 12),
            "slice_1_012.wav"
        );
        assert_eq!(slice_file_name(Path::new("hearing"), 0, 3), "slice_0_003.mp3");
    }

    #[test]
    fn mime_types_follow_extension() {
        assert_eq!(mime_for(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(mime_for(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for(Path::new("a.m4a")), "audio/mp4");
    }

    /// Backend double that replays a scripted response sequence.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<SliceTranscription, ApiError>>>,
        hang_when_empty: bool,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<SliceTranscription, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                hang_when_empty: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                hang_when_empty: true,
            })
        }

        fn remaining(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SpeechBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn transcribe(
            &self,
            _client: &reqwest::Client,
            _api_key: &str,
            _request: TranscriptionRequest,
        ) -> Result<SliceTranscription, ApiError> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(response) => response,
                None if self.hang_when_empty => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(ApiError::Unknown("script exhausted".to_string())),
            }
        }

        fn liveness_url(&self) -> String {
            "http://localhost/models".to_string()
        }
    }

    fn sample_result() -> SliceTranscription {
        SliceTranscription {
            text: "The committee will come to order.".to_string(),
            duration_s: 12.0,
            language: "en".to_string(),
            segments: vec![crate::provider::ApiSegment {
                start: 0.0,
                end: 12.0,
                text: "The committee will come to order.".to_string(),
            }],
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        reporter: Arc<ProgressReporter>,
        cleanup: Arc<CleanupScheduler>,
        cancel: crate::cancel::CancelHandle,
        ctx: SubmitContext,
        updates: tokio::sync::broadcast::Receiver<crate::progress::ProgressRecord>,
    }

    fn fixture(backend: Arc<dyn SpeechBackend>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hearing.mp3");
        std::fs::write(&source, vec![0u8; 4096]).unwrap();

        let reporter =
            Arc::new(ProgressReporter::new(dir.path().join("progress"), 3, 24).unwrap());
        let updates = reporter.subscribe();
        reporter.start("job").unwrap();
        reporter.set_total_slices("job", 1).unwrap();
        reporter
            .set_stage("job", Stage::Transcribing, "transcribing")
            .unwrap();

        let monitor = Arc::new(MemoryMonitor::new(u64::MAX));
        let cleanup = Arc::new(CleanupScheduler::start(monitor));
        let (cancel, token) = cancel_pair();

        let ctx = SubmitContext {
            job_id: "job".to_string(),
            source,
            config: PipelineConfig::default(),
            limiter: Arc::new(TokenBucket::new(20, 20.0 / 60.0)),
            reporter: Arc::clone(&reporter),
            cleanup: Arc::clone(&cleanup),
            backend,
            retry: RetryPolicy::default(),
            api_key: "sk-test".to_string(),
            language: None,
            prompt: None,
            cancel: token,
        };
        Fixture {
            _dir: dir,
            reporter,
            cleanup,
            cancel,
            ctx,
            updates,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_retries_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Network("connection reset".to_string())),
            Ok(sample_result()),
        ]);
        let fixture = fixture(backend.clone());
        let mut updates = fixture.updates;

        let result = submit_direct(fixture.ctx, 12.0).await.unwrap();
        assert_eq!(result.text, "The committee will come to order.");
        assert_eq!(backend.remaining(), 0);

        // State trace: in_flight -> retrying(1) -> in_flight -> succeeded.
        let mut trace = Vec::new();
        while let Ok(record) = updates.try_recv() {
            if let Some(state) = record.per_slice.get(&0) {
                if trace.last() != Some(state) {
                    trace.push(state.clone());
                }
            }
        }
        let kinds: Vec<&str> = trace
            .iter()
            .map(|state| match state {
                SliceState::Pending => "pending",
                SliceState::Extracting => "extracting",
                SliceState::Queued => "queued",
                SliceState::InFlight => "in_flight",
                SliceState::Retrying { .. } => "retrying",
                SliceState::Succeeded => "succeeded",
                SliceState::Failed { .. } => "failed",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["pending", "queued", "in_flight", "retrying", "in_flight", "succeeded"]
        );
        fixture.cleanup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Auth("invalid key".to_string())),
            Ok(sample_result()),
        ]);
        let fixture = fixture(backend.clone());

        let err = submit_direct(fixture.ctx, 12.0).await.unwrap_err();
        assert!(matches!(
            err,
            HansardError::TranscriptionRejected { index: 0, .. }
        ));
        // The scripted success was never consumed: exactly one call happened.
        assert_eq!(backend.remaining(), 1);

        let record = fixture.reporter.snapshot("job").unwrap();
        assert!(matches!(
            record.per_slice[&0],
            SliceState::Failed { ref reason } if reason == "auth"
        ));
        fixture.cleanup.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_in_flight_submission() {
        let fixture = fixture(ScriptedBackend::hanging());
        let cancel = fixture.cancel;
        let reporter = Arc::clone(&fixture.reporter);
        let cleanup = Arc::clone(&fixture.cleanup);

        let job = tokio::spawn(submit_direct(fixture.ctx, 12.0));
        // Let the worker reach its in-flight await.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let err = job.await.unwrap().unwrap_err();
        assert!(matches!(err, HansardError::Cancelled));
        let record = reporter.snapshot("job").unwrap();
        assert!(matches!(
            record.per_slice[&0],
            SliceState::Failed { ref reason } if reason == "cancelled"
        ));
        cleanup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_transcription_failed() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Server { status: 502, message: "bad gateway".into() }),
            Err(ApiError::Server { status: 503, message: "unavailable".into() }),
            Err(ApiError::Server { status: 500, message: "oops".into() }),
        ]);
        let fixture = fixture(backend.clone());

        let err = submit_direct(fixture.ctx, 12.0).await.unwrap_err();
        // Server errors retry twice, so the third response is the last straw.
        let HansardError::TranscriptionFailed { index, attempts, .. } = err else {
            panic!("expected TranscriptionFailed, got {err}");
        };
        assert_eq!(index, 0);
        assert_eq!(attempts, 3);
        assert_eq!(backend.remaining(), 0);
        fixture.cleanup.shutdown().await;
    }
}

