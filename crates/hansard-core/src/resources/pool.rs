//! Scratch directory pool.
//!
//! Each job leases exactly one scratch directory for its slice files and
//! returns it on every exit path. Returned directories are wiped and kept
//! warm for the next job, unless the pool is full or memory pressure says to
//! give the space back to the OS.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::resources::memory::MemoryMonitor;
use crate::{verbose, warn};

/// Pool usage counters for status output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub deleted: u64,
    pub idle: usize,
    pub leased: usize,
}

struct PoolInner {
    idle: Vec<PathBuf>,
    counter: u64,
    leased: usize,
    stats: PoolStats,
}

/// Bounded pool of scratch directories under one root.
pub struct ResourcePool {
    root: PathBuf,
    capacity: usize,
    monitor: Arc<MemoryMonitor>,
    inner: Mutex<PoolInner>,
}

/// A leased scratch directory. Dropping the lease returns the directory to
/// the pool, so error and cancellation paths cannot leak scratch space.
pub struct ScratchLease {
    pool: Arc<ResourcePool>,
    path: PathBuf,
    returned: bool,
}

impl ScratchLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the directory explicitly (same as dropping, but visible).
    pub fn release(mut self) {
        self.return_to_pool();
    }

    fn return_to_pool(&mut self) {
        if !self.returned {
            self.returned = true;
            self.pool.give_back(&self.path);
        }
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

impl ResourcePool {
    /// Pool rooted at `root`, keeping at most `capacity` idle directories.
    pub fn new(root: PathBuf, capacity: usize, monitor: Arc<MemoryMonitor>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create scratch root {}", root.display()))?;
        Ok(Arc::new(Self {
            root,
            capacity,
            monitor,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                counter: 0,
                leased: 0,
                stats: PoolStats::default(),
            }),
        }))
    }

    /// Lease a scratch directory, reusing an idle one when possible.
    pub fn lease(self: &Arc<Self>) -> Result<ScratchLease> {
        if self.monitor.pressure() {
            self.evict_idle();
        }
        let reuse = {
            let mut inner = self.inner.lock().unwrap();
            inner.leased += 1;
            if let Some(path) = inner.idle.pop() {
                inner.stats.reused += 1;
                Ok(path)
            } else {
                inner.counter += 1;
                inner.stats.created += 1;
                Err(inner.counter)
            }
        };
        let path = match reuse {
            Ok(path) => {
                verbose!("scratch: reusing {}", path.display());
                path
            }
            Err(counter) => {
                let path = self
                    .root
                    .join(format!("hansard_{}_{counter:03}", std::process::id()));
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("failed to create scratch dir {}", path.display()))?;
                verbose!("scratch: created {}", path.display());
                path
            }
        };
        Ok(ScratchLease {
            pool: Arc::clone(self),
            path,
            returned: false,
        })
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.idle = inner.idle.len();
        stats.leased = inner.leased;
        stats
    }

    /// Delete every idle directory (memory pressure or shutdown).
    pub fn evict_idle(&self) {
        let drained: Vec<PathBuf> = {
            let mut inner = self.inner.lock().unwrap();
            let drained = std::mem::take(&mut inner.idle);
            inner.stats.deleted += drained.len() as u64;
            drained
        };
        for path in drained {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                warn!("scratch: failed to remove {}: {err}", path.display());
            }
        }
    }

    fn give_back(&self, path: &Path) {
        let keep = {
            let mut inner = self.inner.lock().unwrap();
            inner.leased = inner.leased.saturating_sub(1);
            inner.idle.len() < self.capacity
        } && !self.monitor.pressure();

        if keep {
            if let Err(err) = wipe_contents(path) {
                warn!("scratch: failed to wipe {}: {err}", path.display());
                let _ = std::fs::remove_dir_all(path);
                self.inner.lock().unwrap().stats.deleted += 1;
                return;
            }
            self.inner.lock().unwrap().idle.push(path.to_path_buf());
        } else {
            if let Err(err) = std::fs::remove_dir_all(path) {
                warn!("scratch: failed to remove {}: {err}", path.display());
            }
            self.inner.lock().unwrap().stats.deleted += 1;
        }
    }
}

/// Remove everything inside `dir`, keeping the directory itself.
fn wipe_contents(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
