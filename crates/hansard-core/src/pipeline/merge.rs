//! Merging per-slice transcriptions into one transcript.
//!
//! Timestamps come back slice-local; merging shifts them by each slice's
//! start, sorts, and drops the later copy of anything the overlap made the
//! service hear twice. The tolerance sits just under the planner overlap so
//! genuinely adjacent segments are never collapsed.

use crate::audio::SliceSpec;
use crate::error::HansardError;
use crate::provider::SliceTranscription;
use crate::transcript::Segment;
use crate::verbose;

/// A segment that begins this close before the end of an already-kept
/// segment is the overlap duplicate of it. Slightly under the 30 s planner
/// overlap to absorb timing drift between neighbouring slices.
pub const OVERLAP_TOLERANCE_SECS: f64 = 25.0;

/// Output of a merge, before job metadata is attached.
#[derive(Debug, Clone)]
pub struct MergedTranscript {
    pub text: String,
    pub segments: Vec<Segment>,
    pub duration_s: f64,
    pub language: String,
}

/// Merge slice results ordered by slice index.
///
/// `results[i]` must be the transcription of `plan[i]`; the caller only gets
/// here once every slice has succeeded. Deterministic for identical inputs.
pub fn merge_slices(
    results: &[SliceTranscription],
    plan: &[SliceSpec],
) -> Result<MergedTranscript, HansardError> {
    if results.len() != plan.len() {
        return Err(HansardError::MergeInvariantViolated(format!(
            "{} slice results for {} planned slices",
            results.len(),
            plan.len()
        )));
    }
    if results.is_empty() {
        return Err(HansardError::MergeInvariantViolated(
            "no slice results to merge".to_string(),
        ));
    }

    // Shift slice-local timestamps onto the source timeline.
    let mut shifted: Vec<Segment> = Vec::new();
    for (result, spec) in results.iter().zip(plan) {
        for segment in &result.segments {
            if !segment.start.is_finite() || !segment.end.is_finite() {
                return Err(HansardError::MergeInvariantViolated(format!(
                    "non-finite timestamps in slice {}",
                    spec.index
                )));
            }
            shifted.push(Segment {
                id: 0,
                start_s: segment.start + spec.start_s,
                end_s: segment.end + spec.start_s,
                text: segment.text.trim().to_string(),
            });
        }
    }

    shifted.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));

    // Drop a segment that begins inside the tail of the previously kept one:
    // the earlier slice heard the utterance from its beginning, so its copy
    // wins.
    let mut kept: Vec<Segment> = Vec::with_capacity(shifted.len());
    let mut dropped = 0usize;
    for segment in shifted {
        let duplicate = kept.last().is_some_and(|prev| {
            segment.start_s < prev.end_s
                && segment.start_s > prev.end_s - OVERLAP_TOLERANCE_SECS
        });
        if duplicate {
            dropped += 1;
            continue;
        }
        kept.push(segment);
    }
    if dropped > 0 {
        verbose!("merge: dropped {dropped} overlap duplicates");
    }

    for (id, segment) in kept.iter_mut().enumerate() {
        segment.id = id;
    }

    let text = kept
        .iter()
        .map(|segment| segment.text.as_str())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let duration_s = kept
        .iter()
        .map(|segment| segment.end_s)
        .fold(0.0_f64, f64::max);

    Ok(MergedTranscript {
        text,
        segments: kept,
        duration_s,
        language: results[0].language.clone(),
    })
}
