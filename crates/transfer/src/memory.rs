//! Host memory sampling.
//!
//! Sampling is a blocking read of OS counters; callers on the async runtime
//! go through `spawn_blocking` (see [`Relay::prepare`](crate::Relay::prepare)).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;

use crate::TransferError;

/// Point-in-time view of host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    /// Free plus reclaimable memory.
    pub available_bytes: u64,
}

impl MemorySnapshot {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Used memory as a percentage of total, `0.0..=100.0`.
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Source of host memory snapshots.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Result<MemorySnapshot, TransferError>;
}

/// Reads the live host counters through `sysinfo`.
pub struct SystemMemorySampler {
    system: Mutex<System>,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> Result<MemorySnapshot, TransferError> {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total_bytes = sys.total_memory();
        if total_bytes == 0 {
            return Err(TransferError::MemorySample(
                "host reported zero total memory".into(),
            ));
        }
        Ok(MemorySnapshot {
            total_bytes,
            available_bytes: sys.available_memory().min(total_bytes),
        })
    }
}

/// Reuses a snapshot for `ttl` to keep bursts of admissions from hammering
/// the OS. A zero TTL disables caching.
pub struct CachedSampler<S> {
    inner: S,
    ttl: Duration,
    cached: Mutex<Option<(Instant, MemorySnapshot)>>,
}

impl<S: MemorySampler> CachedSampler<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Drops the cached snapshot so the next call samples the host.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

impl<S: MemorySampler> MemorySampler for CachedSampler<S> {
    fn sample(&self) -> Result<MemorySnapshot, TransferError> {
        if !self.ttl.is_zero() {
            if let Some((at, snapshot)) = *self.cached.lock() {
                if at.elapsed() < self.ttl {
                    return Ok(snapshot);
                }
            }
        }
        let snapshot = self.inner.sample()?;
        *self.cached.lock() = Some((Instant::now(), snapshot));
        Ok(snapshot)
    }
}

/// Fixed, settable values. Used in tests and for hosts where memory is
/// pinned by the deployment (cgroup limits the OS view does not reflect).
#[derive(Debug)]
pub struct StaticSampler {
    total: AtomicU64,
    available: AtomicU64,
}

impl StaticSampler {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self {
            total: AtomicU64::new(total_bytes),
            available: AtomicU64::new(available_bytes),
        }
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::SeqCst);
    }
}

impl MemorySampler for StaticSampler {
    fn sample(&self) -> Result<MemorySnapshot, TransferError> {
        let total_bytes = self.total.load(Ordering::SeqCst);
        Ok(MemorySnapshot {
            total_bytes,
            available_bytes: self.available.load(Ordering::SeqCst).min(total_bytes),
        })
    }
}

impl<T: MemorySampler + ?Sized> MemorySampler for std::sync::Arc<T> {
    fn sample(&self) -> Result<MemorySnapshot, TransferError> {
        (**self).sample()
    }
}
