//! Memory-aware admission control.
//!
//! Every transfer must hold an [`ActiveSlot`] before its first byte is
//! accepted. A slot reserves the transfer's estimated footprint against a
//! budget derived from a fresh memory sample, and gives it back exactly once
//! when dropped.
//!
//! The sample is taken before the registry lock so a slow OS read never
//! blocks concurrent admissions; the check-and-insert then happens under one
//! lock so two racing requests cannot both squeeze into the same headroom.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::TransferError;
use crate::config::AdmissionPolicy;
use crate::memory::MemorySampler;

/// Snapshot of admission bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionStats {
    pub active_slots: usize,
    pub reserved_bytes: u64,
    pub admitted_total: u64,
    pub denied_total: u64,
    pub released_total: u64,
}

struct SlotRecord {
    reserved: u64,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, SlotRecord>,
    reserved_bytes: u64,
}

struct Inner {
    policy: AdmissionPolicy,
    sampler: Arc<dyn MemorySampler>,
    registry: Mutex<Registry>,
    admitted: AtomicU64,
    denied: AtomicU64,
    released: AtomicU64,
}

impl Inner {
    fn release(&self, transfer_id: &str) -> bool {
        let mut reg = self.registry.lock();
        match reg.slots.remove(transfer_id) {
            Some(record) => {
                reg.reserved_bytes = reg.reserved_bytes.saturating_sub(record.reserved);
                drop(reg);
                self.released.fetch_add(1, Ordering::Relaxed);
                debug!(transfer_id, bytes = record.reserved, "admission slot released");
                true
            }
            None => false,
        }
    }
}

/// Decides whether a transfer may start.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                sampler,
                registry: Mutex::new(Registry::default()),
                admitted: AtomicU64::new(0),
                denied: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.inner.policy
    }

    /// Admits `transfer_id` if its estimated footprint fits the current
    /// budget.
    ///
    /// Blocking: this samples host memory.
    pub fn try_admit(
        &self,
        transfer_id: &str,
        declared_size: u64,
    ) -> Result<ActiveSlot, TransferError> {
        let footprint = self.inner.policy.estimate_footprint(declared_size);
        self.try_admit_with_footprint(transfer_id, declared_size, footprint)
    }

    /// Like [`try_admit`](Self::try_admit) with an explicit footprint
    /// instead of the policy estimate.
    pub fn try_admit_with_footprint(
        &self,
        transfer_id: &str,
        declared_size: u64,
        footprint: u64,
    ) -> Result<ActiveSlot, TransferError> {
        let policy = &self.inner.policy;
        let snapshot = match self.inner.sampler.sample() {
            Ok(s) => s,
            Err(e) => {
                self.inner.denied.fetch_add(1, Ordering::Relaxed);
                warn!(transfer_id, error = %e, "admission denied: memory sample failed");
                return Err(e);
            }
        };

        let usage = snapshot.usage_percent();
        if usage > policy.max_usage_percent as f64 {
            self.inner.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                transfer_id,
                usage_percent = usage,
                ceiling = policy.max_usage_percent,
                "admission denied: host memory above ceiling"
            );
            return Err(TransferError::AdmissionDenied {
                requested: footprint,
                headroom: 0,
            });
        }

        let budget = policy.budget(&snapshot);
        let mut reg = self.inner.registry.lock();
        if reg.slots.contains_key(transfer_id) {
            return Err(TransferError::ProtocolViolation(format!(
                "transfer {transfer_id} is already admitted"
            )));
        }

        let headroom = budget.saturating_sub(reg.reserved_bytes);
        // Strict: a request that would land exactly on the budget is denied.
        if reg.reserved_bytes.saturating_add(footprint) >= budget {
            drop(reg);
            self.inner.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                transfer_id,
                requested = footprint,
                headroom,
                "admission denied: insufficient memory"
            );
            return Err(TransferError::AdmissionDenied {
                requested: footprint,
                headroom,
            });
        }

        reg.slots.insert(
            transfer_id.to_string(),
            SlotRecord {
                reserved: footprint,
            },
        );
        reg.reserved_bytes += footprint;
        let reserved_total = reg.reserved_bytes;
        drop(reg);

        self.inner.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            transfer_id,
            declared_size,
            footprint,
            reserved_total,
            budget,
            "transfer admitted"
        );

        Ok(ActiveSlot {
            inner: self.inner.clone(),
            transfer_id: transfer_id.to_string(),
            reserved_memory_bytes: footprint,
            declared_size,
            started_at: Instant::now(),
        })
    }

    /// Releases the slot held by `transfer_id`.
    ///
    /// Idempotent: returns `false` if nothing was held. The slot guard's own
    /// drop becomes a no-op afterwards.
    pub fn release(&self, transfer_id: &str) -> bool {
        self.inner.release(transfer_id)
    }

    pub fn is_admitted(&self, transfer_id: &str) -> bool {
        self.inner.registry.lock().slots.contains_key(transfer_id)
    }

    pub fn stats(&self) -> AdmissionStats {
        let reg = self.inner.registry.lock();
        AdmissionStats {
            active_slots: reg.slots.len(),
            reserved_bytes: reg.reserved_bytes,
            admitted_total: self.inner.admitted.load(Ordering::Relaxed),
            denied_total: self.inner.denied.load(Ordering::Relaxed),
            released_total: self.inner.released.load(Ordering::Relaxed),
        }
    }
}

/// A granted admission. Dropping it releases the reservation.
pub struct ActiveSlot {
    inner: Arc<Inner>,
    transfer_id: String,
    reserved_memory_bytes: u64,
    declared_size: u64,
    started_at: Instant,
}

impl ActiveSlot {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn reserved_memory_bytes(&self) -> u64 {
        self.reserved_memory_bytes
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl std::fmt::Debug for ActiveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSlot")
            .field("transfer_id", &self.transfer_id)
            .field("reserved_memory_bytes", &self.reserved_memory_bytes)
            .field("declared_size", &self.declared_size)
            .finish()
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner.release(&self.transfer_id);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::memory::StaticSampler;

    const MB: u64 = 1_000_000;

    fn controller(available: u64, max_usage_percent: u8) -> AdmissionController {
        let policy = AdmissionPolicy {
            max_usage_percent,
            reserved_bytes: 0,
            footprint_percent: 100,
        };
        AdmissionController::new(policy, Arc::new(StaticSampler::new(available, available)))
    }

    #[test]
    fn admits_until_budget_then_denies() {
        // 95 MB budget, 10 MB per transfer: nine fit, the tenth does not.
        let ctl = controller(95 * MB, 100);
        let mut slots = Vec::new();
        for i in 0..9 {
            slots.push(ctl.try_admit(&format!("t{i}"), 10 * MB).unwrap());
        }
        let err = ctl.try_admit("t9", 10 * MB).unwrap_err();
        match err {
            TransferError::AdmissionDenied { requested, headroom } => {
                assert_eq!(requested, 10 * MB);
                assert_eq!(headroom, 5 * MB);
            }
            other => panic!("unexpected error: {other}"),
        }

        let stats = ctl.stats();
        assert_eq!(stats.active_slots, 9);
        assert_eq!(stats.reserved_bytes, 90 * MB);
        assert_eq!(stats.denied_total, 1);
    }

    #[test]
    fn landing_exactly_on_budget_is_denied() {
        let ctl = controller(100 * MB, 100);
        let _a = ctl.try_admit("a", 90 * MB).unwrap();
        assert!(ctl.try_admit("b", 10 * MB).is_err());
        assert!(ctl.try_admit("c", 10 * MB - 1).is_ok());
    }

    #[test]
    fn denies_above_usage_ceiling() {
        let sampler = Arc::new(StaticSampler::new(100 * MB, 10 * MB));
        let policy = AdmissionPolicy {
            max_usage_percent: 75,
            reserved_bytes: 0,
            footprint_percent: 10,
        };
        let ctl = AdmissionController::new(policy, sampler.clone());
        assert!(matches!(
            ctl.try_admit("t", 1),
            Err(TransferError::AdmissionDenied { headroom: 0, .. })
        ));

        sampler.set_available(50 * MB);
        assert!(ctl.try_admit("t", 1).is_ok());
    }

    #[test]
    fn drop_releases_exactly_once() {
        let ctl = controller(100 * MB, 100);
        let slot = ctl.try_admit("t", 10 * MB).unwrap();
        assert!(ctl.is_admitted("t"));

        assert!(ctl.release("t"));
        assert!(!ctl.release("t"));
        drop(slot);

        let stats = ctl.stats();
        assert_eq!(stats.active_slots, 0);
        assert_eq!(stats.reserved_bytes, 0);
        assert_eq!(stats.released_total, 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let ctl = controller(100 * MB, 100);
        let _slot = ctl.try_admit("t", MB).unwrap();
        assert!(matches!(
            ctl.try_admit("t", MB),
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn released_capacity_is_reusable() {
        let ctl = controller(25 * MB, 100);
        let a = ctl.try_admit("a", 10 * MB).unwrap();
        let _b = ctl.try_admit("b", 10 * MB).unwrap();
        assert!(ctl.try_admit("c", 10 * MB).is_err());
        drop(a);
        assert!(ctl.try_admit("c", 10 * MB).is_ok());
    }

    #[test]
    fn concurrent_admission_never_overcommits() {
        let ctl = controller(95 * MB, 100);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ctl = ctl.clone();
                thread::spawn(move || ctl.try_admit(&format!("t{i}"), 10 * MB).ok())
            })
            .collect();
        let slots: Vec<ActiveSlot> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(slots.len(), 9);
        let stats = ctl.stats();
        assert!(stats.reserved_bytes < 95 * MB);
        assert_eq!(stats.admitted_total + stats.denied_total, 32);

        drop(slots);
        assert_eq!(ctl.stats().reserved_bytes, 0);
        assert_eq!(ctl.stats().released_total, 9);
    }
}
