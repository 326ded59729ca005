//! Audio metadata extraction via `ffprobe`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

use super::AudioError;

/// Immutable description of an audio file, as reported by `ffprobe`.
#[derive(Debug, Clone)]
pub struct AudioMetadata {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub codec: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub bitrate_bps: Option<u64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
}

/// Probe an audio file.
///
/// Pure function of the file's contents; never retries. The caller decides
/// whether a failure is worth retrying.
pub async fn probe(path: &Path) -> Result<AudioMetadata, AudioError> {
    if !path.exists() {
        return Err(AudioError::NotFound(path.to_path_buf()));
    }
    let size_bytes = std::fs::metadata(path)?.len();

    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => AudioError::ProbeUnavailable,
            _ => AudioError::Io(err),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AudioError::UnreadableAudio(format!(
            "ffprobe exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|err| AudioError::UnreadableAudio(format!("unparseable ffprobe output: {err}")))?;

    let duration_seconds = parsed
        .format
        .duration
        .as_deref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0);
    if duration_seconds <= 0.0 {
        return Err(AudioError::UnreadableAudio(
            "file reports zero duration".to_string(),
        ));
    }

    let stream = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| AudioError::UnreadableAudio("no audio stream found".to_string()))?;

    Ok(AudioMetadata {
        path: path.to_path_buf(),
        size_bytes,
        duration_seconds,
        codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
        sample_rate_hz: stream
            .sample_rate
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        channels: stream.channels.unwrap_or(0),
        bitrate_bps: parsed.format.bit_rate.as_deref().and_then(|raw| raw.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = probe(Path::new("/nonexistent/hearing.mp3")).await.unwrap_err();
        assert!(matches!(err, AudioError::NotFound(_)));
    }

    #[test]
    fn parses_ffprobe_json() {
        let raw = r#"{
            "format": {"duration": "1800.250000", "bit_rate": "128000"},
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg"},
                {"codec_type": "audio", "codec_name": "mp3", "sample_rate": "44100", "channels": 2}
            ]
        }"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.format.duration.as_deref(), Some("1800.250000"));
        let audio = parsed
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("audio"))
            .unwrap();
        assert_eq!(audio.codec_name.as_deref(), Some("mp3"));
        assert_eq!(audio.channels, Some(2));
    }
}
