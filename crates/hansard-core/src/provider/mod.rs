//! Speech service client.
//!
//! The remote service is opaque: one multipart POST per audio blob, a JSON
//! body with segment timings back. [`SpeechBackend`] is the seam the pipeline
//! submits through, so tests can substitute a double without touching HTTP.

mod error;
pub mod retry;
mod whisper;

pub use error::ApiError;
pub use retry::{RetryClass, RetryDecision, RetryLog, RetryPolicy};
pub use whisper::WhisperBackend;

use async_trait::async_trait;

/// One audio blob headed for the speech service.
pub struct TranscriptionRequest {
    pub audio_data: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
    /// Optional ISO-639-1 language hint.
    pub language: Option<String>,
    /// Optional context prompt (hearing title); at most 224 tokens are used
    /// by the service.
    pub prompt: Option<String>,
}

/// A segment as reported by the service, slice-local timestamps.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Parsed verbose transcription response.
#[derive(Debug, Clone)]
pub struct SliceTranscription {
    pub text: String,
    pub duration_s: f64,
    pub language: String,
    pub segments: Vec<ApiSegment>,
}

/// Trait for the remote speech service.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &'static str;

    /// Submit one blob; returns the transcription or a typed error.
    async fn transcribe(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        request: TranscriptionRequest,
    ) -> Result<SliceTranscription, ApiError>;

    /// URL probed by preflight to confirm the service is reachable.
    fn liveness_url(&self) -> String;
}
