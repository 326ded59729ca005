//! Process and system memory monitoring.
//!
//! Slicing and submission are streaming operations; this monitor is the
//! backstop that notices when something grows anyway and tells the resource
//! pool and cleanup scheduler to shed scratch space.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, System};

use crate::cancel::CancelToken;
use crate::verbose;

/// System memory percentage above which pressure is declared.
const SYSTEM_PRESSURE_PERCENT: f32 = 85.0;

/// Available-memory floor below which pressure is declared.
const MIN_AVAILABLE_BYTES: u64 = 100 * 1024 * 1024;

/// Samples kept for trend analysis.
const HISTORY_LEN: usize = 60;

/// Samples needed before a trend is reported.
const TREND_WINDOW: usize = 10;

/// Background sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One memory observation.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub process_rss_bytes: u64,
    pub system_used_percent: f32,
    pub available_bytes: u64,
}

/// Direction of recent process memory use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Snapshot for status output.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub current: MemorySample,
    pub pressure: bool,
    pub trend: Option<MemoryTrend>,
    pub samples: usize,
}

struct MonitorInner {
    sys: System,
    pid: Pid,
    history: VecDeque<MemorySample>,
}

/// Samples process RSS and system memory; classifies pressure.
pub struct MemoryMonitor {
    cap_bytes: u64,
    inner: Mutex<MonitorInner>,
}

impl MemoryMonitor {
    /// Monitor declaring pressure when process RSS exceeds `cap_bytes`.
    pub fn new(cap_bytes: u64) -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| Pid::from_u32(0));
        Self {
            cap_bytes,
            inner: Mutex::new(MonitorInner {
                sys: System::new(),
                pid,
                history: VecDeque::with_capacity(HISTORY_LEN),
            }),
        }
    }

    /// Take a fresh sample and append it to the history window.
    pub fn sample(&self) -> MemorySample {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner.pid;
        inner.sys.refresh_memory();
        inner.sys.refresh_process(pid);

        let total = inner.sys.total_memory().max(1);
        let sample = MemorySample {
            process_rss_bytes: inner.sys.process(pid).map(|p| p.memory()).unwrap_or(0),
            system_used_percent: inner.sys.used_memory() as f32 / total as f32 * 100.0,
            available_bytes: inner.sys.available_memory(),
        };
        if inner.history.len() == HISTORY_LEN {
            inner.history.pop_front();
        }
        inner.history.push_back(sample);
        sample
    }

    /// True when any pressure threshold is crossed.
    pub fn pressure(&self) -> bool {
        let sample = self.sample();
        sample.process_rss_bytes > self.cap_bytes
            || sample.system_used_percent > SYSTEM_PRESSURE_PERCENT
            || sample.available_bytes < MIN_AVAILABLE_BYTES
    }

    /// Trend over the last [`TREND_WINDOW`] samples; `None` until enough
    /// history exists.
    pub fn trend(&self) -> Option<MemoryTrend> {
        let inner = self.inner.lock().unwrap();
        if inner.history.len() < TREND_WINDOW {
            return None;
        }
        let recent: Vec<_> = inner
            .history
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .rev()
            .map(|sample| sample.process_rss_bytes as f64)
            .collect();
        let half = TREND_WINDOW / 2;
        let early = recent[..half].iter().sum::<f64>() / half as f64;
        let late = recent[half..].iter().sum::<f64>() / (TREND_WINDOW - half) as f64;
        if early <= 0.0 {
            return Some(MemoryTrend::Stable);
        }
        let change_percent = (late - early) / early * 100.0;
        Some(if change_percent > 10.0 {
            MemoryTrend::Increasing
        } else if change_percent < -10.0 {
            MemoryTrend::Decreasing
        } else {
            MemoryTrend::Stable
        })
    }

    /// Cleanup can wait when memory is flat and under every threshold.
    pub fn cleanup_deferrable(&self) -> bool {
        !self.pressure() && matches!(self.trend(), Some(MemoryTrend::Stable) | None)
    }

    /// Current stats for status output.
    pub fn stats(&self) -> MemoryStats {
        let current = self.sample();
        let pressure = current.process_rss_bytes > self.cap_bytes
            || current.system_used_percent > SYSTEM_PRESSURE_PERCENT
            || current.available_bytes < MIN_AVAILABLE_BYTES;
        let trend = self.trend();
        let samples = self.inner.lock().unwrap().history.len();
        MemoryStats {
            current,
            pressure,
            trend,
            samples,
        }
    }

    /// Run the 1 s sampling loop until cancelled.
    pub fn spawn_sampler(self: &Arc<Self>, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SAMPLE_INTERVAL) => {
                        let sample = monitor.sample();
                        verbose!(
                            "memory: rss {} MiB, system {:.0}%, available {} MiB",
                            sample.process_rss_bytes / (1024 * 1024),
                            sample.system_used_percent,
                            sample.available_bytes / (1024 * 1024)
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_reports_a_live_process() {
        let monitor = MemoryMonitor::new(u64::MAX);
        let sample = monitor.sample();
        assert!(sample.system_used_percent >= 0.0);
        assert!(sample.system_used_percent <= 100.0);
    }

    #[test]
    fn generous_cap_means_no_process_pressure() {
        let monitor = MemoryMonitor::new(u64::MAX);
        let sample = monitor.sample();
        // Only system-wide conditions could trigger pressure here.
        if sample.system_used_percent <= SYSTEM_PRESSURE_PERCENT
            && sample.available_bytes >= MIN_AVAILABLE_BYTES
        {
            assert!(!monitor.pressure());
        }
    }

    #[test]
    fn zero_cap_always_pressures() {
        let monitor = MemoryMonitor::new(0);
        assert!(monitor.pressure());
    }

    #[test]
    fn trend_needs_a_full_window() {
        let monitor = MemoryMonitor::new(u64::MAX);
        for _ in 0..TREND_WINDOW - 1 {
            monitor.sample();
        }
        assert!(monitor.trend().is_none());
        monitor.sample();
        assert!(monitor.trend().is_some());
    }
}
