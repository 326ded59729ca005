//! Default values for pipeline configuration.

/// Largest request body the speech service accepts before returning 413.
pub const SERVICE_UPLOAD_LIMIT_BYTES: u64 = 25 * 1024 * 1024;

/// Upload ceiling we plan against. Kept 5 MiB under the service limit so that
/// codec-copy slicing slop never produces a rejected request.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// Nominal bytes per slice used to estimate the slice count. The planner adds
/// one extra slice on top of the estimate, which is what actually pulls the
/// per-slice size under [`DEFAULT_MAX_UPLOAD_BYTES`].
pub const DEFAULT_TARGET_SLICE_BYTES: u64 = SERVICE_UPLOAD_LIMIT_BYTES;

/// Seconds shared between the tail of one slice and the head of the next.
pub const DEFAULT_OVERLAP_SECONDS: f64 = 30.0;

/// Concurrent slice submissions per job.
pub const DEFAULT_MAX_CONCURRENT_SLICES: usize = 3;

/// Token bucket burst size for the speech API.
pub const DEFAULT_RATE_LIMIT_CAPACITY: u32 = 20;

/// Token bucket refill rate (tokens per second): 20 requests per minute.
pub const DEFAULT_RATE_LIMIT_REFILL_PER_S: f64 = 20.0 / 60.0;

/// Process RSS threshold for memory pressure, in MiB.
pub const DEFAULT_MEMORY_CAP_MB: u64 = 200;

/// Hours a progress snapshot file is kept after its job goes quiet.
pub const DEFAULT_RETENTION_HOURS_PROGRESS: u64 = 24;

/// Base URL of the remote speech service.
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Per-request timeout for speech API calls (5 minutes).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Scratch directories the resource pool keeps warm.
pub const DEFAULT_POOL_CAPACITY: usize = 3;
