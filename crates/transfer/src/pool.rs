//! Tiered, bounded buffer pool.
//!
//! Each tier keeps at most `max_buffers` pooled buffers alive. When a tier
//! is exhausted, checkout hands out a *transient* buffer instead of
//! blocking; transients are freed on return rather than pooled, so resident
//! memory stays bounded while a burst is still served.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{BufferTier, PoolConfig};

/// Per-tier pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStats {
    pub tier: BufferTier,
    pub buffer_size: usize,
    pub max_buffers: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Pooled buffers alive, idle or checked out. Never above `max_buffers`.
    pub resident: usize,
    pub transient_outstanding: usize,
    pub transient_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub tiers: Vec<TierStats>,
}

impl PoolStats {
    pub fn tier(&self, tier: BufferTier) -> &TierStats {
        &self.tiers[tier.index()]
    }

    pub fn checked_out(&self) -> usize {
        self.tiers
            .iter()
            .map(|t| t.checked_out + t.transient_outstanding)
            .sum()
    }
}

struct TierPool {
    tier: BufferTier,
    buffer_size: usize,
    max_buffers: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    resident: AtomicUsize,
    checked_out: AtomicUsize,
    transient_outstanding: AtomicUsize,
    transient_total: AtomicU64,
}

impl TierPool {
    fn new(tier: BufferTier, config: &PoolConfig) -> Self {
        let cfg = config.tier(tier);
        let idle: Vec<Vec<u8>> = (0..cfg.baseline)
            .map(|_| Vec::with_capacity(cfg.buffer_size))
            .collect();
        Self {
            tier,
            buffer_size: cfg.buffer_size,
            max_buffers: cfg.max_buffers,
            resident: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
            checked_out: AtomicUsize::new(0),
            transient_outstanding: AtomicUsize::new(0),
            transient_total: AtomicU64::new(0),
        }
    }

    fn take(&self) -> (Vec<u8>, bool) {
        if let Some(buf) = self.idle.lock().pop() {
            self.checked_out.fetch_add(1, Ordering::SeqCst);
            return (buf, false);
        }

        let grew = self
            .resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_buffers).then_some(n + 1)
            })
            .is_ok();
        if grew {
            self.checked_out.fetch_add(1, Ordering::SeqCst);
            return (Vec::with_capacity(self.buffer_size), false);
        }

        self.transient_outstanding.fetch_add(1, Ordering::SeqCst);
        self.transient_total.fetch_add(1, Ordering::Relaxed);
        debug!(tier = ?self.tier, "buffer tier exhausted, allocating transient");
        (Vec::with_capacity(self.buffer_size), true)
    }

    fn give_back(&self, mut buf: Vec<u8>, transient: bool) {
        if transient {
            self.transient_outstanding.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        // A buffer that grew past its tier would inflate resident memory.
        if buf.capacity() > self.buffer_size {
            self.resident.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        buf.clear();
        self.idle.lock().push(buf);
    }

    fn stats(&self) -> TierStats {
        TierStats {
            tier: self.tier,
            buffer_size: self.buffer_size,
            max_buffers: self.max_buffers,
            idle: self.idle.lock().len(),
            checked_out: self.checked_out.load(Ordering::SeqCst),
            resident: self.resident.load(Ordering::SeqCst),
            transient_outstanding: self.transient_outstanding.load(Ordering::SeqCst),
            transient_total: self.transient_total.load(Ordering::Relaxed),
        }
    }
}

/// Shared pool of chunk buffers in three size classes.
pub struct BufferPool {
    tiers: [TierPool; 3],
}

impl BufferPool {
    /// Builds the pool and pre-allocates each tier's baseline.
    pub fn new(config: &PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            tiers: BufferTier::ALL.map(|t| TierPool::new(t, config)),
        })
    }

    /// Checks out a buffer from `tier`. Never blocks.
    pub fn checkout(self: &Arc<Self>, tier: BufferTier) -> PooledBuffer {
        let (data, transient) = self.tiers[tier.index()].take();
        PooledBuffer {
            pool: self.clone(),
            tier,
            transient,
            data,
        }
    }

    /// Checks out from the smallest tier whose buffers hold `len` bytes, or
    /// `None` if `len` exceeds the largest tier.
    pub fn checkout_for(self: &Arc<Self>, len: usize) -> Option<PooledBuffer> {
        let tier = self.tier_for(len)?;
        Some(self.checkout(tier))
    }

    pub fn tier_for(&self, len: usize) -> Option<BufferTier> {
        self.tiers
            .iter()
            .find(|t| len <= t.buffer_size)
            .map(|t| t.tier)
    }

    pub fn buffer_size(&self, tier: BufferTier) -> usize {
        self.tiers[tier.index()].buffer_size
    }

    /// Largest payload a single buffer can hold.
    pub fn max_buffer_size(&self) -> usize {
        self.tiers[BufferTier::Large.index()].buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tiers: self.tiers.iter().map(TierPool::stats).collect(),
        }
    }
}

/// A checked-out buffer. Returns to its tier on drop; transient buffers are
/// freed instead.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    tier: BufferTier,
    transient: bool,
    data: Vec<u8>,
}

impl PooledBuffer {
    pub fn tier(&self) -> BufferTier {
        self.tier
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Capacity of the tier this buffer belongs to.
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size(self.tier)
    }

    /// Replaces the contents with `bytes`. Returns `false` without copying
    /// if `bytes` does not fit the tier.
    pub fn fill_from(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.capacity() {
            return false;
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        true
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.tiers[self.tier.index()].give_back(data, self.transient);
    }
}
