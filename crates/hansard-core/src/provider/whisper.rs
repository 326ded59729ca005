//! OpenAI Whisper transcription backend.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ApiError, ApiSegment, SliceTranscription, SpeechBackend, TranscriptionRequest};

const MODEL: &str = "whisper-1";

/// Whisper API backend; `base_url` is configurable so tests and proxies can
/// point it elsewhere.
#[derive(Debug, Clone)]
pub struct WhisperBackend {
    base_url: String,
    timeout_secs: u64,
}

/// Verbose JSON response; unknown fields are ignored.
#[derive(Deserialize)]
struct VerboseResponse {
    text: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<ApiSegment>,
}

impl WhisperBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    fn transcriptions_url(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl SpeechBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        request: TranscriptionRequest,
    ) -> Result<SliceTranscription, ApiError> {
        let mut form = reqwest::multipart::Form::new()
            .text("model", MODEL)
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment")
            .part(
                "file",
                reqwest::multipart::Part::bytes(request.audio_data)
                    .file_name(request.filename)
                    .mime_str(&request.mime_type)
                    .map_err(|err| ApiError::InvalidResponse(err.to_string()))?,
            );

        if let Some(language) = request.language {
            form = form.text("language", language);
        }
        if let Some(prompt) = request.prompt {
            form = form.text("prompt", prompt);
        }

        let response = client
            .post(self.transcriptions_url())
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await
            .map_err(|err| ApiError::from_transport(err, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ApiError::from_transport(err, self.timeout_secs))?;
        let parsed: VerboseResponse = serde_json::from_str(&body)
            .map_err(|err| ApiError::InvalidResponse(err.to_string()))?;

        Ok(SliceTranscription {
            text: parsed.text,
            duration_s: parsed.duration,
            language: if parsed.language.is_empty() {
                "en".to_string()
            } else {
                parsed.language
            },
            segments: parsed.segments,
        })
    }

    fn liveness_url(&self) -> String {
        format!("{}/models", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbose_json_ignoring_unknown_fields() {
        let raw = r#"{
            "task": "transcribe",
            "text": "The committee will come to order.",
            "duration": 12.4,
            "language": "english",
            "segments": [
                {"id": 0, "start": 0.0, "end": 4.2, "text": "The committee", "avg_logprob": -0.2},
                {"id": 1, "start": 4.2, "end": 12.4, "text": "will come to order."}
            ]
        }"#;
        let parsed: VerboseResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text, "The committee will come to order.");
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[1].start, 4.2);
    }

    #[test]
    fn urls_are_built_from_the_base() {
        let backend = WhisperBackend::new("https://api.openai.com/v1/", 300);
        assert_eq!(
            backend.transcriptions_url(),
            "https://api.openai.com/v1/audio/transcriptions"
        );
        assert_eq!(backend.liveness_url(), "https://api.openai.com/v1/models");
    }
}
