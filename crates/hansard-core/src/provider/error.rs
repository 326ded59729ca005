//! Typed speech-API errors.
//!
//! Classification is driven by HTTP status and transport error shape, never
//! by substring-matching error text. The retry machinery keys off
//! [`ApiError::retry_class`]; everything without a class is non-retryable.

use reqwest::StatusCode;

use super::retry::RetryClass;

/// Error from one speech-API submission.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 429 from the service.
    #[error("rate limited by the speech service: {0}")]
    RateLimited(String),

    /// Connection-level failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The request hit the client-side timeout.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// 5xx from the service.
    #[error("speech service error ({status}): {message}")]
    Server { status: u16, message: String },

    /// 401/403: credential rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// 400: the request itself is malformed.
    #[error("request rejected ({status}): {message}")]
    BadRequest { status: u16, message: String },

    /// 413: a slice outgrew the service limit, which means the plan was wrong.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// 415: the service does not accept this container/codec.
    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    /// 200 with a body we could not interpret.
    #[error("invalid response from the speech service: {0}")]
    InvalidResponse(String),

    /// Anything else.
    #[error("speech service failure: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Map a non-success HTTP status (plus response body) to a typed error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = summarize(body);
        match status.as_u16() {
            401 | 403 => ApiError::Auth(message),
            400 => ApiError::BadRequest {
                status: status.as_u16(),
                message,
            },
            413 => ApiError::PayloadTooLarge(message),
            415 => ApiError::UnsupportedMedia(message),
            429 => ApiError::RateLimited(message),
            500..=599 => ApiError::Server {
                status: status.as_u16(),
                message,
            },
            _ => ApiError::Unknown(format!("HTTP {status}: {message}")),
        }
    }

    /// Map a transport-level reqwest error.
    pub fn from_transport(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(timeout_secs)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ApiError::Network(err.to_string())
        } else {
            ApiError::Unknown(err.to_string())
        }
    }

    /// Retry class for this error, or `None` when it must not be retried.
    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            ApiError::RateLimited(_) => Some(RetryClass::RateLimit),
            ApiError::Network(_) => Some(RetryClass::Network),
            ApiError::Timeout(_) => Some(RetryClass::Timeout),
            ApiError::Server { .. } => Some(RetryClass::Server),
            ApiError::Auth(_)
            | ApiError::BadRequest { .. }
            | ApiError::PayloadTooLarge(_)
            | ApiError::UnsupportedMedia(_)
            | ApiError::InvalidResponse(_)
            | ApiError::Unknown(_) => None,
        }
    }

    /// Short machine-readable kind, used in progress records.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::RateLimited(_) => "rate_limit",
            ApiError::Network(_) => "network",
            ApiError::Timeout(_) => "timeout",
            ApiError::Server { .. } => "server",
            ApiError::Auth(_) => "auth",
            ApiError::BadRequest { .. } => "bad_request",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::UnsupportedMedia(_) => "unsupported_media",
            ApiError::InvalidResponse(_) => "invalid_response",
            ApiError::Unknown(_) => "unknown",
        }
    }
}

/// Keep response bodies out of logs and progress records beyond one line.
fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no response body".to_string();
    }
    let line = trimmed.lines().next().unwrap_or(trimmed);
    if line.len() > 300 {
        let mut end = 300;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    } else {
        line.to_string()
    }
}
