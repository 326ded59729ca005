//! Global HTTP client singleton.
//!
//! One `reqwest::Client` per process, shared by the speech API client and the
//! preflight liveness check. Reusing the client avoids repeating the TLS
//! handshake and certificate store population on every request.

use std::sync::OnceLock;

use anyhow::{Context, Result};

use crate::configuration::DEFAULT_REQUEST_TIMEOUT_SECS;

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get the global HTTP client, creating it on first use.
pub fn get_http_client() -> Result<&'static reqwest::Client> {
    if let Some(client) = HTTP_CLIENT.get() {
        return Ok(client);
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
        .build()
        .context("Failed to create HTTP client")?;
    Ok(HTTP_CLIENT.get_or_init(|| client))
}
