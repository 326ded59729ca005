//! Audio inspection, slicing and slice planning.
//!
//! The pipeline never decodes audio itself: `ffprobe` reports metadata and
//! `ffmpeg -c copy` extracts time ranges without re-encoding, so memory stays
//! flat no matter how long the recording is.

mod planner;
mod probe;
mod slicer;

pub use planner::{plan, Plan, PlannerConfig, SlicePlan, SliceSpec, MAX_REPLANS};
pub use probe::{probe, AudioMetadata};
pub use slicer::extract_slice;

use std::path::PathBuf;

/// Errors from probing, slicing or planning.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The input file does not exist.
    #[error("audio file not found: {0}")]
    NotFound(PathBuf),

    /// `ffprobe` is not installed or not on PATH.
    #[error("ffprobe is not available. Make sure ffmpeg is installed.")]
    ProbeUnavailable,

    /// `ffprobe` ran but its output could not be interpreted, or the file
    /// carries no usable audio stream.
    #[error("could not read audio metadata: {0}")]
    UnreadableAudio(String),

    /// `ffmpeg` is not installed or not on PATH.
    #[error("ffmpeg is not available. Make sure ffmpeg is installed.")]
    SliceToolMissing,

    /// `ffmpeg` exited non-zero while extracting a slice.
    #[error("slice extraction failed: {0}")]
    SliceFailed(String),

    /// The requested time range does not lie within the recording.
    #[error("invalid time range: start {start}s, duration {duration}s")]
    TimeRangeInvalid { start: f64, duration: f64 },

    /// The planner could not produce slices under the upload limit within the
    /// re-plan budget.
    #[error("no feasible slice plan after {0} attempts")]
    PlanInfeasible(u32),

    /// I/O error while handling slice files.
    #[error("audio I/O error: {0}")]
    Io(#[from] std::io::Error),
}
