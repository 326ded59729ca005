//! Job-level error taxonomy.
//!
//! Slice workers surface typed errors to the pipeline; the first
//! non-cancellation error cancels its siblings and becomes the job's
//! terminal error. Retryable failures never escape a slice worker.

pub use crate::audio::AudioError;
pub use crate::provider::ApiError;

/// Terminal error of a transcription job.
#[derive(Debug, thiserror::Error)]
pub enum HansardError {
    /// Preconditions not met; the pipeline never started. Carries every
    /// failing check, not just the first.
    #[error("preflight failed: {}", items.join("; "))]
    PreflightFailed { items: Vec<String> },

    /// The planner could not produce slices under the upload limit within
    /// the re-plan budget.
    #[error("could not plan slices under the upload limit after {replans} re-plans")]
    PlanInfeasible { replans: u32 },

    /// Extraction of one slice failed.
    #[error("slice {index} extraction failed: {source}")]
    SliceExtractionFailed {
        index: usize,
        #[source]
        source: AudioError,
    },

    /// A slice exhausted its retries.
    #[error("slice {index} failed after {attempts} attempts: {source}")]
    TranscriptionFailed {
        index: usize,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    /// The service rejected a slice with a non-retryable error.
    #[error("slice {index} rejected: {source}")]
    TranscriptionRejected {
        index: usize,
        #[source]
        source: ApiError,
    },

    /// An internal merge invariant failed; this is a bug, not bad input.
    #[error("merge invariant violated: {0}")]
    MergeInvariantViolated(String),

    /// Writing the transcript, snapshot or store row failed.
    #[error("failed to persist {target}: {cause}")]
    PersistenceFailed { target: String, cause: String },

    /// The job was cancelled.
    #[error("job cancelled")]
    Cancelled,

    /// Probe or planning failure outside the slice workers.
    #[error(transparent)]
    Audio(#[from] AudioError),
}

impl HansardError {
    /// Short machine-readable kind for progress records.
    pub fn kind(&self) -> &'static str {
        match self {
            HansardError::PreflightFailed { .. } => "preflight",
            HansardError::PlanInfeasible { .. } => "plan_infeasible",
            HansardError::SliceExtractionFailed { .. } => "slice_extraction",
            HansardError::TranscriptionFailed { .. } => "transcription_failed",
            HansardError::TranscriptionRejected { source, .. } => source.kind(),
            HansardError::MergeInvariantViolated(_) => "merge_invariant",
            HansardError::PersistenceFailed { .. } => "persistence",
            HansardError::Cancelled => "cancelled",
            HansardError::Audio(_) => "audio",
        }
    }

    /// Whether this terminal state is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HansardError::Cancelled)
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, HansardError>;
