//! Time-range extraction via `ffmpeg -c copy`.

use std::path::Path;

use tokio::process::Command;

use super::AudioError;

/// Extract `[start_s, start_s + duration_s]` from `src` into `dest`.
///
/// The codec is copied without re-encoding, so the extraction is I/O bound
/// and safe to run concurrently against the same read-only source. On failure
/// `dest` is removed; a partial output file is never left behind.
pub async fn extract_slice(
    src: &Path,
    start_s: f64,
    duration_s: f64,
    dest: &Path,
) -> Result<(), AudioError> {
    if start_s < 0.0 || duration_s <= 0.0 || !start_s.is_finite() || !duration_s.is_finite() {
        return Err(AudioError::TimeRangeInvalid {
            start: start_s,
            duration: duration_s,
        });
    }
    if !src.exists() {
        return Err(AudioError::NotFound(src.to_path_buf()));
    }

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(src)
        .args(["-ss", &format!("{start_s}"), "-t", &format!("{duration_s}")])
        .args(["-c", "copy", "-avoid_negative_ts", "make_zero", "-y"])
        .arg(dest)
        .output()
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => AudioError::SliceToolMissing,
            _ => AudioError::Io(err),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let _ = std::fs::remove_file(dest);
        return Err(AudioError::SliceFailed(stderr));
    }

    // ffmpeg can exit zero having written nothing when -ss lands past EOF.
    let written = std::fs::metadata(dest).map(|meta| meta.len()).unwrap_or(0);
    if written == 0 {
        let _ = std::fs::remove_file(dest);
        return Err(AudioError::SliceFailed(format!(
            "empty slice output for range {start_s}s +{duration_s}s"
        )));
    }

    Ok(())
}
