//! Deferred deletion of scratch files.
//!
//! A single background worker consumes `(path, policy)` requests into a
//! due-time priority queue. Memory pressure short-circuits the schedule:
//! due items are drained first, then `on_pressure` items are promoted to
//! immediate. Shutdown drains everything still pending, so no scratch file
//! outlives the scheduler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::{cancel_pair, CancelHandle};
use crate::resources::memory::MemoryMonitor;
use crate::{verbose, warn};

/// Idle poll cadence; pressure is re-evaluated at least this often.
const TICK: Duration = Duration::from_secs(1);

/// When a scheduled path should be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Delete as soon as the worker sees it.
    Immediate,
    /// Delete 30 seconds after scheduling.
    AfterUse,
    /// Delete in 5 minutes, or now under memory pressure.
    OnPressure,
    /// Delete 10 minutes after the job completes.
    OnCompletion,
}

impl CleanupPolicy {
    pub fn delay(&self) -> Duration {
        match self {
            CleanupPolicy::Immediate => Duration::ZERO,
            CleanupPolicy::AfterUse => Duration::from_secs(30),
            CleanupPolicy::OnPressure => Duration::from_secs(300),
            CleanupPolicy::OnCompletion => Duration::from_secs(600),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct CleanupItem {
    due: Instant,
    seq: u64,
    path: PathBuf,
    policy: CleanupPolicyTag,
}

// Policy without behavior, for queue bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupPolicyTag {
    Plain,
    OnPressure,
}

impl Ord for CleanupItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for CleanupItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deletion counters for status output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub items_cleaned: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    pub pending: usize,
}

/// Handle to the cleanup worker.
pub struct CleanupScheduler {
    tx: mpsc::UnboundedSender<CleanupItem>,
    seq: AtomicUsize,
    pending: Arc<AtomicUsize>,
    stats: Arc<Mutex<CleanupStats>>,
    cancel: CancelHandle,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Spawn the worker.
    pub fn start(monitor: Arc<MemoryMonitor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel, token) = cancel_pair();
        let pending = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(Mutex::new(CleanupStats::default()));
        let worker = tokio::spawn(run_worker(
            rx,
            token,
            monitor,
            Arc::clone(&pending),
            Arc::clone(&stats),
        ));
        Self {
            tx,
            seq: AtomicUsize::new(0),
            pending,
            stats,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `path` for deletion under `policy`.
    pub fn schedule(&self, path: impl Into<PathBuf>, policy: CleanupPolicy) {
        let item = CleanupItem {
            due: Instant::now() + policy.delay(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) as u64,
            path: path.into(),
            policy: match policy {
                CleanupPolicy::OnPressure => CleanupPolicyTag::OnPressure,
                _ => CleanupPolicyTag::Plain,
            },
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("cleanup: worker is gone, request dropped");
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CleanupStats {
        let mut stats = *self.stats.lock().unwrap();
        stats.pending = self.pending.load(Ordering::SeqCst);
        stats
    }

    /// Stop the worker, draining every pending deletion first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<CleanupItem>,
    cancel: crate::cancel::CancelToken,
    monitor: Arc<MemoryMonitor>,
    pending: Arc<AtomicUsize>,
    stats: Arc<Mutex<CleanupStats>>,
) {
    let mut queue: BinaryHeap<Reverse<CleanupItem>> = BinaryHeap::new();

    loop {
        let wait = queue
            .peek()
            .map(|Reverse(item)| item.due)
            .unwrap_or_else(|| Instant::now() + TICK);

        tokio::select! {
            incoming = rx.recv() => match incoming {
                Some(item) => queue.push(Reverse(item)),
                None => break,
            },
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(wait.min(Instant::now() + TICK)) => {}
        }

        let now = Instant::now();
        while queue
            .peek()
            .is_some_and(|Reverse(item)| item.due <= now)
        {
            let Reverse(item) = queue.pop().unwrap();
            execute(&item.path, &pending, &stats);
        }

        // Due work is done; under pressure, promote on_pressure items next.
        if !queue.is_empty() && monitor.pressure() {
            let mut keep = BinaryHeap::new();
            for Reverse(item) in queue.drain() {
                if item.policy == CleanupPolicyTag::OnPressure {
                    execute(&item.path, &pending, &stats);
                } else {
                    keep.push(Reverse(item));
                }
            }
            queue = keep;
        }
    }

    // Drain on shutdown: scratch files must not outlive the scheduler.
    while let Ok(item) = rx.try_recv() {
        queue.push(Reverse(item));
    }
    for Reverse(item) in queue.drain() {
        execute(&item.path, &pending, &stats);
    }
}

fn execute(path: &Path, pending: &AtomicUsize, stats: &Mutex<CleanupStats>) {
    pending.fetch_sub(1, Ordering::SeqCst);
    if !path.exists() {
        return;
    }
    let size = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    let outcome = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    let mut stats = stats.lock().unwrap();
    match outcome {
        Ok(()) => {
            stats.items_cleaned += 1;
            stats.bytes_freed += size;
            verbose!("cleanup: removed {} ({size} bytes)", path.display());
        }
        Err(err) => {
            stats.errors += 1;
            warn!("cleanup: failed to remove {}: {err}", path.display());
        }
    }
}
