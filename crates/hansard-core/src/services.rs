//! Process-scoped service set.
//!
//! Every job is passed explicit references to the rate limiter, resource
//! pool, progress reporter and cleanup scheduler held here; nothing hides in
//! module-level globals. Initialise once at startup, tear down at shutdown.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::cancel::{cancel_pair, CancelHandle};
use crate::configuration::{PipelineConfig, DEFAULT_POOL_CAPACITY};
use crate::limiter::TokenBucket;
use crate::pipeline::{spawn_job, JobEnv, JobHandle, SubmitOptions};
use crate::preflight::{run_preflight, PreflightReport};
use crate::progress::ProgressReporter;
use crate::provider::{RetryPolicy, SpeechBackend, WhisperBackend};
use crate::resources::{
    CleanupScheduler, CleanupStats, MemoryMonitor, MemoryStats, PoolStats, ResourcePool,
};
use crate::store::HearingStore;

/// Combined service counters for status output.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub cleanup: CleanupStats,
    pub memory: MemoryStats,
    pub rate_tokens_available: f64,
}

/// Owned services shared by every job in the process.
pub struct ServiceSet {
    config: PipelineConfig,
    limiter: Arc<TokenBucket>,
    pool: Arc<ResourcePool>,
    reporter: Arc<ProgressReporter>,
    cleanup: Arc<CleanupScheduler>,
    monitor: Arc<MemoryMonitor>,
    store: Arc<HearingStore>,
    backend: Arc<dyn SpeechBackend>,
    retry: RetryPolicy,
    shutdown: CancelHandle,
    sampler: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServiceSet {
    /// Start the service set against the real speech service. Must be called
    /// from within a tokio runtime; background workers spawn here.
    pub fn start(config: PipelineConfig) -> Result<Arc<Self>> {
        let backend: Arc<dyn SpeechBackend> = Arc::new(WhisperBackend::new(
            config.api_base_url.clone(),
            config.request_timeout_secs,
        ));
        Self::start_with_backend(config, backend)
    }

    /// Start with a custom backend; the seam tests substitute a double into.
    pub fn start_with_backend(
        config: PipelineConfig,
        backend: Arc<dyn SpeechBackend>,
    ) -> Result<Arc<Self>> {
        let monitor = Arc::new(MemoryMonitor::new(config.memory_cap_bytes()));
        let pool = ResourcePool::new(
            config.scratch_root.join("hansard-scratch"),
            DEFAULT_POOL_CAPACITY,
            Arc::clone(&monitor),
        )?;
        let reporter = Arc::new(ProgressReporter::new(
            config.progress_dir.clone(),
            config.max_concurrent_slices,
            config.retention_hours_progress,
        )?);
        let cleanup = Arc::new(CleanupScheduler::start(Arc::clone(&monitor)));
        let store = Arc::new(
            HearingStore::open(&config.db_path)
                .context("failed to open the hearing metadata store")?,
        );
        let limiter = Arc::new(TokenBucket::new(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_s,
        ));

        let (shutdown, token) = cancel_pair();
        let sampler = monitor.spawn_sampler(token);

        Ok(Arc::new(Self {
            config,
            limiter,
            pool,
            reporter,
            cleanup,
            monitor,
            store,
            backend,
            retry: RetryPolicy::default(),
            shutdown,
            sampler: Mutex::new(Some(sampler)),
        }))
    }

    /// Submit a transcription job.
    pub fn submit(&self, job_id: &str, audio_path: PathBuf, options: SubmitOptions) -> JobHandle {
        let env = JobEnv {
            config: self.config.clone(),
            limiter: Arc::clone(&self.limiter),
            pool: Arc::clone(&self.pool),
            reporter: Arc::clone(&self.reporter),
            cleanup: Arc::clone(&self.cleanup),
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
            retry: self.retry.clone(),
        };
        spawn_job(env, job_id.to_string(), audio_path, options)
    }

    /// Run the preflight gate without starting a job.
    pub async fn preflight(&self, audio_path: &std::path::Path, hearing_id: &str) -> PreflightReport {
        run_preflight(
            audio_path,
            hearing_id,
            &self.config,
            &self.store,
            self.backend.as_ref(),
        )
        .await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &HearingStore {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<ProgressReporter> {
        &self.reporter
    }

    /// Combined counters for status output.
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            pool: self.pool.stats(),
            cleanup: self.cleanup.stats(),
            memory: self.monitor.stats(),
            rate_tokens_available: self.limiter.available().await,
        }
    }

    /// Stop background workers, draining pending cleanup and evicting idle
    /// scratch directories.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sampler = self.sampler.lock().unwrap().take();
        if let Some(sampler) = sampler {
            let _ = sampler.await;
        }
        self.cleanup.shutdown().await;
        self.pool.evict_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;

    use crate::pipeline::SubmitOptions;
    use crate::progress::{SliceState, Stage};
    use crate::provider::{ApiError, SliceTranscription, TranscriptionRequest};
    use crate::transcript::ProcessingMethod;

    fn test_config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            scratch_root: root.join("scratch"),
            output_dir: root.join("out"),
            progress_dir: root.join("progress"),
            db_path: root.join("hearings.sqlite"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn services_start_and_shut_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceSet::start(test_config(dir.path())).unwrap();
        let stats = services.stats().await;
        assert_eq!(stats.pool.leased, 0);
        assert!(stats.rate_tokens_available > 0.0);
        services.shutdown().await;
    }

    #[tokio::test]
    async fn store_is_shared_with_callers() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceSet::start(test_config(dir.path())).unwrap();
        services
            .store()
            .upsert_hearing("sh-1", "Oversight", "Banking", "2025-06-12")
            .unwrap();
        assert!(services.store().hearing("sh-1").unwrap().is_some());
        services.shutdown().await;
    }

    // -- end-to-end scenarios (need the ffmpeg tools on PATH) --------------

    /// Backend double answering every slice with the same two segments.
    struct EchoBackend;

    #[async_trait]
    impl crate::provider::SpeechBackend for EchoBackend {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn transcribe(
            &self,
            _client: &reqwest::Client,
            _api_key: &str,
            request: TranscriptionRequest,
        ) -> Result<SliceTranscription, ApiError> {
            assert!(!request.audio_data.is_empty());
            Ok(SliceTranscription {
                text: "the chair recognizes the witness".to_string(),
                duration_s: 9.0,
                language: "en".to_string(),
                segments: vec![
                    crate::provider::ApiSegment {
                        start: 0.0,
                        end: 5.0,
                        text: "the chair recognizes".to_string(),
                    },
                    crate::provider::ApiSegment {
                        start: 5.0,
                        end: 9.0,
                        text: "the witness".to_string(),
                    },
                ],
            })
        }

        fn liveness_url(&self) -> String {
            "http://localhost/models".to_string()
        }
    }

    /// Backend double rejecting the first request and hanging on the rest.
    struct AuthFailBackend {
        rejected: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl crate::provider::SpeechBackend for AuthFailBackend {
        fn name(&self) -> &'static str {
            "auth-fail"
        }

        async fn transcribe(
            &self,
            _client: &reqwest::Client,
            _api_key: &str,
            _request: TranscriptionRequest,
        ) -> Result<SliceTranscription, ApiError> {
            if !self.rejected.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(ApiError::Auth("invalid key".to_string()));
            }
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn liveness_url(&self) -> String {
            "http://localhost/models".to_string()
        }
    }

    /// Minimal 16 kHz mono 16-bit PCM WAV, `seconds` long.
    fn write_wav(path: &Path, seconds: u32) {
        let sample_rate = 16_000u32;
        let num_samples = sample_rate * seconds;
        let data_len = num_samples * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample_index in 0..num_samples {
            let sample = ((sample_index as f64 * 0.05).sin() * 8000.0) as i16;
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn leftover_scratch_files(scratch_root: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(scratch_root) else {
            return 0;
        };
        entries
            .flatten()
            .map(|dir| {
                std::fs::read_dir(dir.path())
                    .map(|inner| inner.count())
                    .unwrap_or(0)
            })
            .sum()
    }

    #[tokio::test]
    #[ignore] // Requires ffmpeg and ffprobe on PATH
    async fn direct_job_produces_a_persisted_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("hearing.wav");
        write_wav(&audio, 30);
        unsafe { std::env::set_var("OPENAI_API_KEY", "sk-test") };

        let config = test_config(dir.path());
        let services = ServiceSet::start_with_backend(config, Arc::new(EchoBackend)).unwrap();
        services
            .store()
            .upsert_hearing("sh-direct", "Oversight", "Banking", "2025-06-12")
            .unwrap();

        let mut handle = services.submit(
            "sh-direct",
            audio,
            SubmitOptions {
                prefer_parallel: true,
                skip_preflight: true,
            },
        );
        let transcript = handle.await_result().await.unwrap();
        assert_eq!(transcript.metadata.method, ProcessingMethod::Direct);
        assert_eq!(transcript.metadata.chunks, 1);
        assert_eq!(transcript.segments.len(), 2);

        let record = services.store().hearing("sh-direct").unwrap().unwrap();
        assert_eq!(record.processing_stage, crate::store::STAGE_TRANSCRIBED);
        assert!(record.full_text_content.is_some());

        let path = crate::transcript::Transcript::output_path(
            &services.config().output_dir,
            "sh-direct",
        );
        assert!(path.exists());
        services.shutdown().await;
    }

    #[tokio::test]
    #[ignore] // Requires ffmpeg and ffprobe on PATH
    async fn chunked_job_covers_the_recording_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("hearing.wav");
        // 60s of 16kHz PCM is ~1.9 MiB; a 300 KiB ceiling forces chunking.
        write_wav(&audio, 60);
        unsafe { std::env::set_var("OPENAI_API_KEY", "sk-test") };

        let config = PipelineConfig {
            max_upload_bytes: 300 * 1024,
            target_slice_bytes: 360 * 1024,
            overlap_seconds: 2.0,
            ..test_config(dir.path())
        };
        let scratch_root = config.scratch_root.join("hansard-scratch");
        let services = ServiceSet::start_with_backend(config, Arc::new(EchoBackend)).unwrap();
        services
            .store()
            .upsert_hearing("sh-chunked", "Oversight", "Banking", "2025-06-12")
            .unwrap();

        let mut handle = services.submit(
            "sh-chunked",
            audio,
            SubmitOptions {
                prefer_parallel: true,
                skip_preflight: true,
            },
        );
        let transcript = handle.await_result().await.unwrap();
        assert_eq!(transcript.metadata.method, ProcessingMethod::Chunked);
        assert!(transcript.metadata.chunks >= 2);

        // Coverage: the merged transcript spans nearly the whole recording.
        assert!(transcript.duration_s >= 55.0);
        for pair in transcript.segments.windows(2) {
            assert!(pair[0].start_s <= pair[1].start_s);
        }

        let record = services.reporter().snapshot("sh-chunked").unwrap();
        assert_eq!(record.stage, Stage::Done);
        assert_eq!(record.overall_percent, 100);
        assert!(record
            .per_slice
            .values()
            .all(|state| matches!(state, SliceState::Succeeded)));

        services.shutdown().await;
        // Cleanup completeness: nothing of the job is left on disk.
        assert_eq!(leftover_scratch_files(&scratch_root), 0);
    }

    #[tokio::test]
    #[ignore] // Requires ffmpeg and ffprobe on PATH
    async fn auth_rejection_cancels_sibling_slices() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("hearing.wav");
        write_wav(&audio, 60);
        unsafe { std::env::set_var("OPENAI_API_KEY", "sk-test") };

        let config = PipelineConfig {
            max_upload_bytes: 300 * 1024,
            target_slice_bytes: 360 * 1024,
            overlap_seconds: 2.0,
            ..test_config(dir.path())
        };
        let services = ServiceSet::start_with_backend(
            config,
            Arc::new(AuthFailBackend {
                rejected: std::sync::atomic::AtomicBool::new(false),
            }),
        )
        .unwrap();
        services
            .store()
            .upsert_hearing("sh-auth", "Oversight", "Banking", "2025-06-12")
            .unwrap();

        let mut handle = services.submit(
            "sh-auth",
            audio,
            SubmitOptions {
                prefer_parallel: true,
                skip_preflight: true,
            },
        );
        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::HansardError::TranscriptionRejected { .. }
        ));

        // No transcript was persisted.
        let path = crate::transcript::Transcript::output_path(
            &services.config().output_dir,
            "sh-auth",
        );
        assert!(!path.exists());

        // Every slice reached a terminal state; none succeeded.
        let record = services.reporter().snapshot("sh-auth").unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert!(record
            .per_slice
            .values()
            .all(|state| matches!(state, SliceState::Failed { .. } | SliceState::Pending)));
        services.shutdown().await;
    }
}
