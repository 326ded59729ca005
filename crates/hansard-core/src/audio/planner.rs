//! Slice planning for chunked upload.
//!
//! A recording that fits under the upload limit is submitted whole. Anything
//! larger is cut into N overlapping slices of equal nominal duration, where
//! N is one more than the byte-size estimate suggests; the spare slice is the
//! safety margin that keeps each extracted file under the limit. Consecutive
//! slices share `overlap_seconds` of audio so the speech service hears full
//! words at every boundary.

use super::{AudioError, AudioMetadata};
use serde::{Deserialize, Serialize};

/// Upper bound on planner re-runs when an extracted slice overshoots the
/// upload limit.
pub const MAX_REPLANS: u32 = 3;

/// Inputs the planner needs, detached from the full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_upload_bytes: u64,
    pub target_slice_bytes: u64,
    pub overlap_seconds: f64,
}

impl PlannerConfig {
    /// Config for re-plan attempt `replans`, with the target slice size
    /// reduced by 20% per attempt.
    pub fn shrunk(&self, replans: u32) -> Self {
        let factor = 0.8_f64.powi(replans as i32);
        Self {
            target_slice_bytes: ((self.target_slice_bytes as f64) * factor) as u64,
            ..self.clone()
        }
    }
}

/// Outcome of planning: one whole-file submission, or a slice plan.
#[derive(Debug, Clone)]
pub enum Plan {
    Direct,
    Chunked(SlicePlan),
}

/// Ordered slices covering `[0, total_duration_s]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicePlan {
    pub slices: Vec<SliceSpec>,
    pub base_step_s: f64,
    pub overlap_s: f64,
    pub total_duration_s: f64,
}

/// One time range to extract and submit independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceSpec {
    pub index: usize,
    pub start_s: f64,
    pub duration_s: f64,
    pub overlap_head_s: f64,
    pub overlap_tail_s: f64,
}

impl SliceSpec {
    /// End of the slice on the source timeline.
    pub fn end_s(&self) -> f64 {
        self.start_s + self.duration_s
    }
}

/// Decide direct-vs-chunked and compute the slice plan.
pub fn plan(meta: &AudioMetadata, config: &PlannerConfig) -> Result<Plan, AudioError> {
    if meta.size_bytes <= config.max_upload_bytes {
        return Ok(Plan::Direct);
    }

    let total = meta.duration_seconds;
    let estimated = meta.size_bytes.div_ceil(config.target_slice_bytes.max(1)) as usize;
    let count = (estimated + 1).max(2);

    // The configured overlap assumes slices much longer than it; for a short
    // but oversized recording, shrink the overlap so slices still advance.
    let overlap = if total > 4.0 * config.overlap_seconds {
        config.overlap_seconds
    } else {
        total / 4.0
    };

    // Equal nominal durations: each slice spans `step` seconds and starts
    // `step - overlap` after its predecessor, landing the last slice exactly
    // on the end of the recording.
    let step = (total + (count as f64 - 1.0) * overlap) / count as f64;
    let advance = step - overlap;
    if advance <= 0.0 {
        return Err(AudioError::PlanInfeasible(0));
    }

    let mut slices = Vec::with_capacity(count);
    for index in 0..count {
        let start_s = index as f64 * advance;
        let last = index == count - 1;
        slices.push(SliceSpec {
            index,
            start_s,
            duration_s: if last { total - start_s } else { step },
            overlap_head_s: if index == 0 { 0.0 } else { overlap },
            overlap_tail_s: if last { 0.0 } else { overlap },
        });
    }

    Ok(Plan::Chunked(SlicePlan {
        slices,
        base_step_s: step,
        overlap_s: overlap,
        total_duration_s: total,
    }))
}
