// Domain modules (organized by concern)
pub mod audio;
pub mod configuration;
pub mod pipeline;
pub mod preflight;
pub mod provider;
pub mod resources;

// Pipeline infrastructure
pub mod limiter;
pub mod progress;
pub mod services;
pub mod store;
pub mod transcript;

// Utility modules (cross-cutting concerns)
pub mod cancel;
pub mod credentials;
pub mod error;
pub mod http;
pub mod verbose;

// Re-export audio types
pub use audio::{extract_slice, probe, AudioError, AudioMetadata, Plan, SlicePlan, SliceSpec};

// Re-export configuration
pub use configuration::PipelineConfig;

// Re-export pipeline types
pub use pipeline::{JobHandle, JobState, SubmitOptions, OVERLAP_TOLERANCE_SECS};

// Re-export provider types
pub use provider::{
    ApiError, RetryClass, RetryDecision, RetryLog, RetryPolicy, SpeechBackend, WhisperBackend,
};

// Re-export progress types
pub use progress::{ProgressRecord, ProgressReporter, SliceState, Stage};

// Re-export services and storage
pub use error::{HansardError, Result};
pub use limiter::TokenBucket;
pub use preflight::PreflightReport;
pub use resources::{CleanupPolicy, CleanupScheduler, MemoryMonitor, ResourcePool};
pub use services::{ServiceSet, ServiceStats};
pub use store::{HearingRecord, HearingStore};
pub use transcript::{ProcessingMethod, Segment, Transcript};

// Re-export other utility types
pub use http::get_http_client;
pub use verbose::set_verbose;
