//! Speech API credential lookup.
//!
//! The key lives in the system keyring under the `hansard` service, with the
//! `OPENAI_API_KEY` environment variable as a fallback for headless hosts
//! where no keyring daemon is available.

use anyhow::{Context, Result};

const KEYRING_SERVICE: &str = "hansard";
const KEYRING_ACCOUNT: &str = "openai";

/// Environment variable consulted when the keyring has no entry.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Look up the API key: keyring first, environment second.
pub fn lookup_api_key() -> Option<String> {
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
        && let Ok(key) = entry.get_password()
        && !key.is_empty()
    {
        return Some(key);
    }
    std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty())
}

/// Store the API key in the system keyring.
pub fn store_api_key(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
        .context("failed to open keyring entry")?;
    entry
        .set_password(key)
        .context("failed to store API key in keyring")?;
    // Read back so a silently broken keyring surfaces here, not mid-job.
    entry
        .get_password()
        .context("stored API key could not be read back")?;
    Ok(())
}

/// Remove the API key from the system keyring, if present.
pub fn delete_api_key() -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT) {
        let _ = entry.delete_credential();
    }
    Ok(())
}
