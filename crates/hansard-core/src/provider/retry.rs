//! Classified retry with exponential backoff.
//!
//! Each error class has its own base delay and attempt cap; the delay for
//! attempt `n` is `base * 2^n` plus 10-30% jitter. Attempt history lives in a
//! [`RetryLog`] owned by a single slice submission, so retries never leak
//! across slices or jobs.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

/// Retryable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    RateLimit,
    Network,
    Timeout,
    Server,
    /// The extracted slice file itself is bad; the fix is re-extraction, not
    /// waiting.
    ChunkCorruption,
}

/// Delay schedule for one error class.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

/// Per-class schedule table.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    rate_limit: RetrySchedule,
    network: RetrySchedule,
    server: RetrySchedule,
    chunk_corruption: RetrySchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit: RetrySchedule {
                base_delay: Duration::from_secs(60),
                max_attempts: 5,
            },
            network: RetrySchedule {
                base_delay: Duration::from_secs(5),
                max_attempts: 3,
            },
            server: RetrySchedule {
                base_delay: Duration::from_secs(10),
                max_attempts: 2,
            },
            chunk_corruption: RetrySchedule {
                base_delay: Duration::ZERO,
                max_attempts: 1,
            },
        }
    }
}

impl RetryPolicy {
    /// Schedule for an error class.
    pub fn schedule(&self, class: RetryClass) -> RetrySchedule {
        match class {
            RetryClass::RateLimit => self.rate_limit,
            RetryClass::Network | RetryClass::Timeout => self.network,
            RetryClass::Server => self.server,
            RetryClass::ChunkCorruption => self.chunk_corruption,
        }
    }

    /// Decide whether (and after how long) to retry, recording the attempt.
    pub fn decide(&self, log: &mut RetryLog, class: RetryClass) -> RetryDecision {
        let schedule = self.schedule(class);
        let attempt = log.attempts_for(class);
        if attempt >= schedule.max_attempts {
            return RetryDecision::GiveUp {
                attempts: log.total_attempts() + 1,
            };
        }
        let backoff = schedule.base_delay.as_secs_f64() * 2_f64.powi(attempt as i32);
        let jitter = if backoff > 0.0 {
            rand::thread_rng().gen_range(0.1..0.3) * backoff
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64(backoff + jitter);
        log.record(class, delay);
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// 1-based attempt number about to run.
        attempt: u32,
    },
    GiveUp {
        /// Attempts made, including the one that just failed.
        attempts: u32,
    },
}

/// Attempt history for one slice submission.
#[derive(Debug, Default)]
pub struct RetryLog {
    per_class: HashMap<RetryClass, u32>,
    total: u32,
}

impl RetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, class: RetryClass, _delay: Duration) {
        *self.per_class.entry(class).or_insert(0) += 1;
        self.total += 1;
    }

    fn attempts_for(&self, class: RetryClass) -> u32 {
        self.per_class.get(&class).copied().unwrap_or(0)
    }

    /// Retries attempted so far, across all classes.
    pub fn total_attempts(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_retry_three_times_then_give_up() {
        let policy = RetryPolicy::default();
        let mut log = RetryLog::new();
        for attempt in 1..=3 {
            match policy.decide(&mut log, RetryClass::Network) {
                RetryDecision::Retry { attempt: n, .. } => assert_eq!(n, attempt),
                RetryDecision::GiveUp { .. } => panic!("gave up too early"),
            }
        }
        assert!(matches!(
            policy.decide(&mut log, RetryClass::Network),
            RetryDecision::GiveUp { attempts: 4 }
        ));
    }

    #[test]
    fn backoff_doubles_with_jitter() {
        let policy = RetryPolicy::default();
        let mut log = RetryLog::new();
        let mut last = Duration::ZERO;
        for expected_base in [5.0, 10.0, 20.0] {
            let RetryDecision::Retry { delay, .. } = policy.decide(&mut log, RetryClass::Network)
            else {
                panic!("expected a retry");
            };
            let secs = delay.as_secs_f64();
            assert!(secs >= expected_base * 1.1 && secs <= expected_base * 1.3);
            assert!(delay > last);
            last = delay;
        }
    }

    #[test]
    fn chunk_corruption_retries_once_without_delay() {
        let policy = RetryPolicy::default();
        let mut log = RetryLog::new();
        let RetryDecision::Retry { delay, .. } =
            policy.decide(&mut log, RetryClass::ChunkCorruption)
        else {
            panic!("expected a retry");
        };
        assert_eq!(delay, Duration::ZERO);
        assert!(matches!(
            policy.decide(&mut log, RetryClass::ChunkCorruption),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn classes_are_budgeted_independently() {
        let policy = RetryPolicy::default();
        let mut log = RetryLog::new();
        for _ in 0..2 {
            assert!(matches!(
                policy.decide(&mut log, RetryClass::Server),
                RetryDecision::Retry { .. }
            ));
        }
        assert!(matches!(
            policy.decide(&mut log, RetryClass::Server),
            RetryDecision::GiveUp { .. }
        ));
        // A different class still has its own budget.
        assert!(matches!(
            policy.decide(&mut log, RetryClass::Network),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn timeout_shares_the_network_schedule() {
        let policy = RetryPolicy::default();
        let schedule = policy.schedule(RetryClass::Timeout);
        assert_eq!(schedule.base_delay, Duration::from_secs(5));
        assert_eq!(schedule.max_attempts, 3);
    }
}
