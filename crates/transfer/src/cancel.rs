//! Out-of-band cancellation and idle reaping.
//!
//! A cancel request only flags the session; the worker notices at its next
//! checkpoint and finishes as `Cancelled` on its own. A watchdog waits
//! `cancel_timeout` for that to happen and otherwise tears the session down
//! from outside: the worker task is aborted, its slot and buffers are
//! released, and `Cancelled` is reported all the same. A session that was
//! never attached has no worker and is cancelled on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uplink_protocol::CancelStatus;

use crate::TransferError;
use crate::config::SessionConfig;
use crate::session::{Outcome, TransferHandle};

/// Registry of live sessions plus the cancellation and reaping policy.
pub struct CancellationCoordinator {
    sessions: Mutex<HashMap<String, Arc<TransferHandle>>>,
    cancel_timeout: Duration,
    idle_timeout: Duration,
    reap_interval: Duration,
    terminal_retention: Duration,
    reaper_stop: Mutex<Option<oneshot::Sender<()>>>,
    forced_total: AtomicU64,
    reaped_total: AtomicU64,
}

impl CancellationCoordinator {
    pub fn new(config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            cancel_timeout: config.cancel_timeout(),
            idle_timeout: config.idle_timeout(),
            reap_interval: config.reap_interval(),
            terminal_retention: config.terminal_retention(),
            reaper_stop: Mutex::new(None),
            forced_total: AtomicU64::new(0),
            reaped_total: AtomicU64::new(0),
        })
    }

    pub fn register(&self, handle: Arc<TransferHandle>) {
        self.sessions
            .lock()
            .insert(handle.transfer_id().to_string(), handle);
    }

    pub fn get(&self, transfer_id: &str) -> Option<Arc<TransferHandle>> {
        self.sessions.lock().get(transfer_id).cloned()
    }

    /// Sessions that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|h| !h.state().is_terminal())
            .count()
    }

    /// Sessions torn down because cooperative cancellation timed out.
    pub fn forced_total(&self) -> u64 {
        self.forced_total.load(Ordering::Relaxed)
    }

    /// Sessions reaped for inactivity.
    pub fn reaped_total(&self) -> u64 {
        self.reaped_total.load(Ordering::Relaxed)
    }

    /// Requests cancellation of `transfer_id` and returns immediately.
    ///
    /// The acknowledgment only says the request was taken; the session's
    /// own channel reports `cancelled` once it has stopped. Repeated
    /// requests are acknowledged without arming a second watchdog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_cancel(self: &Arc<Self>, transfer_id: &str) -> CancelStatus {
        let Some(handle) = self.get(transfer_id) else {
            debug!(transfer_id, "cancel for unknown transfer");
            return CancelStatus::Unknown;
        };
        if handle.state().is_terminal() {
            return CancelStatus::AlreadyTerminal;
        }
        if !handle.request_cancel() {
            return CancelStatus::Accepted;
        }
        info!(transfer_id, "cancellation requested");

        // Nothing is streaming yet, so there is no worker to observe the token.
        if !handle.is_attached() {
            handle.finish(Outcome::Cancelled);
            return CancelStatus::Accepted;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(this.cancel_timeout, handle.wait_terminal()).await {
                Ok(state) => {
                    debug!(transfer_id = %handle.transfer_id(), ?state, "cancellation settled");
                }
                Err(_) => {
                    if handle.force_teardown(Outcome::Cancelled) {
                        this.forced_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            transfer_id = %handle.transfer_id(),
                            timeout_ms = this.cancel_timeout.as_millis() as u64,
                            "cooperative cancellation timed out, session torn down"
                        );
                    }
                }
            }
        });
        CancelStatus::Accepted
    }

    /// Tears down `transfer_id` immediately. Returns `false` if it was
    /// unknown or already terminal.
    pub fn force_teardown(&self, transfer_id: &str, outcome: Outcome) -> bool {
        let Some(handle) = self.get(transfer_id) else {
            return false;
        };
        let torn_down = handle.force_teardown(outcome);
        if torn_down {
            self.forced_total.fetch_add(1, Ordering::Relaxed);
        }
        torn_down
    }

    /// Requests cancellation of every live session.
    pub fn cancel_all(self: &Arc<Self>) -> usize {
        let ids: Vec<String> = self
            .sessions
            .lock()
            .values()
            .filter(|h| !h.state().is_terminal())
            .map(|h| h.transfer_id().to_string())
            .collect();
        ids.iter()
            .filter(|id| self.request_cancel(id) == CancelStatus::Accepted)
            .count()
    }

    /// One reaper pass: fails sessions idle past `idle_timeout` and forgets
    /// sessions that finished more than `terminal_retention` ago. Returns
    /// the number of sessions reaped.
    pub fn reap_idle(&self) -> usize {
        let handles: Vec<Arc<TransferHandle>> = self.sessions.lock().values().cloned().collect();
        let mut reaped = 0;
        for handle in handles {
            if handle.state().is_terminal() {
                if handle
                    .finished_for()
                    .is_some_and(|d| d >= self.terminal_retention)
                {
                    self.sessions.lock().remove(handle.transfer_id());
                }
                continue;
            }
            let idle = handle.idle_for();
            if idle < self.idle_timeout {
                continue;
            }
            let outcome = Outcome::Failed(TransferError::TransportFault("idle timeout".into()));
            if handle.force_teardown(outcome) {
                reaped += 1;
                warn!(
                    transfer_id = %handle.transfer_id(),
                    idle_ms = idle.as_millis() as u64,
                    attached = handle.is_attached(),
                    "idle session reaped"
                );
            }
        }
        if reaped > 0 {
            self.reaped_total.fetch_add(reaped as u64, Ordering::Relaxed);
        }
        reaped
    }

    /// Starts the periodic reaper in a background task.
    ///
    /// Call [`stop_reaper`](Self::stop_reaper) to cancel.
    pub fn start_reaper(self: &Arc<Self>) {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut stop = self.reaper_stop.lock();
            // Replacing the sender stops any previous reaper.
            *stop = Some(tx);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.reap_idle();
                    }
                    _ = &mut rx => break,
                }
            }
            debug!("idle reaper stopped");
        });
    }

    /// Stops the periodic reaper.
    pub fn stop_reaper(&self) {
        // Dropping the sender signals the task to exit.
        drop(self.reaper_stop.lock().take());
    }
}
