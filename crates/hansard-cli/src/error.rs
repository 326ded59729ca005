//! CLI error display with actionable hints.

use hansard_core::HansardError;

/// Display an error to stderr with a resolution hint where one exists.
pub fn display_error(err: &HansardError) {
    match err {
        HansardError::PreflightFailed { items } => {
            eprintln!("Error: preflight failed");
            for item in items {
                eprintln!("  - {item}");
            }
            eprintln!();
            eprintln!("Hint: fix the items above, or re-run checks alone with:");
            eprintln!("  hansard preflight <AUDIO> --hearing <ID>");
        }

        HansardError::TranscriptionRejected { index, source } => {
            eprintln!("Error: the speech service rejected slice {index}");
            eprintln!("{source}");
            eprintln!();
            eprintln!("Hint: for authentication errors, store a fresh key with:");
            eprintln!("  hansard setup");
        }

        HansardError::TranscriptionFailed { index, attempts, source } => {
            eprintln!("Error: slice {index} failed after {attempts} attempts");
            eprintln!("{source}");
            eprintln!();
            eprintln!("Hint: transient service trouble; try again in a few minutes.");
        }

        HansardError::SliceExtractionFailed { index, source } => {
            eprintln!("Error: could not extract slice {index}");
            eprintln!("{source}");
            eprintln!();
            eprintln!("Hint: make sure ffmpeg is installed and the file plays back.");
        }

        HansardError::Cancelled => {
            eprintln!("Cancelled.");
        }

        other => {
            eprintln!("Error: {other}");
        }
    }
}

/// Bridge for `anyhow::Error`, downcasting to the typed error when possible.
pub fn display_anyhow_error(err: anyhow::Error) {
    if let Some(typed) = err.downcast_ref::<HansardError>() {
        display_error(typed);
    } else {
        eprintln!("Error: {err:#}");
    }
}
