//! Token bucket rate limiter for speech-API submissions.
//!
//! One instance per remote endpoint, shared by every job in the process. Over
//! any window of `T` seconds at most `capacity + refill_per_second * T`
//! tokens can be acquired.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Longest single sleep while waiting for tokens; waking early re-checks the
/// bucket so a concurrent refill is never missed for long.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Async token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_s: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(capacity: u32, refill_per_s: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_s,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire `n` tokens, waiting as long as it takes.
    pub async fn acquire(&self, n: u32) {
        let needed = n as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_s).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= needed {
                    state.tokens -= needed;
                    return;
                }
                Duration::from_secs_f64((needed - state.tokens) / self.refill_per_s)
            };
            // Sleep outside the lock so other acquirers can refill/observe.
            tokio::time::sleep(wait.min(MAX_WAIT_SLICE)).await;
        }
    }

    /// Take `n` tokens only if they are available right now.
    pub async fn try_acquire(&self, n: u32) -> bool {
        let needed = n as f64;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_s).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill), for status output.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_s).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}
