//! Batches: several files admitted and tracked together.
//!
//! Each file of a batch is admitted independently, so a batch can be
//! partially admitted. The batch itself only groups sessions; their
//! lifecycles stay independent and the batch state is derived from them on
//! every status call. A batch whose terminal status has been retrieved is
//! swept once `retention` has passed since that first retrieval.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};
use uplink_protocol::messages::{BatchFileStatus, BatchStatusResponse, FileAdmission};
use uplink_protocol::{BatchState, FileDescriptor, FileState, TransferState};

use crate::TransferError;
use crate::session::TransferHandle;

/// A boxed future returned by [`SessionFactory::prepare`].
pub type PrepareFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<TransferHandle>, TransferError>> + Send + 'a>>;

/// Admits a file and opens its sink object, yielding a session that is
/// ready to be attached.
pub trait SessionFactory: Send + Sync {
    fn prepare<'a>(&'a self, file: &'a FileDescriptor) -> PrepareFuture<'a>;
}

enum Entry {
    Member {
        filename: String,
        handle: Arc<TransferHandle>,
    },
    Rejected {
        filename: String,
    },
}

impl Entry {
    fn state(&self) -> FileState {
        match self {
            Entry::Member { handle, .. } => handle.state().into(),
            Entry::Rejected { .. } => FileState::Rejected,
        }
    }
}

struct BatchRecord {
    entries: Vec<Entry>,
    /// Frozen once a terminal status has been handed out, with the time
    /// it was first handed out.
    retrieved: Option<(BatchStatusResponse, Instant)>,
}

impl BatchRecord {
    fn member_states(&self) -> Vec<TransferState> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Member { handle, .. } => Some(handle.state()),
                Entry::Rejected { .. } => None,
            })
            .collect()
    }

    fn snapshot(&self, batch_id: &str) -> BatchStatusResponse {
        let files = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                Entry::Member { filename, handle } => BatchFileStatus {
                    index,
                    filename: filename.clone(),
                    transfer_id: Some(handle.transfer_id().to_string()),
                    state: entry.state(),
                },
                Entry::Rejected { filename } => BatchFileStatus {
                    index,
                    filename: filename.clone(),
                    transfer_id: None,
                    state: FileState::Rejected,
                },
            })
            .collect();
        BatchStatusResponse {
            batch_id: batch_id.to_string(),
            state: aggregate(&self.member_states()),
            files,
        }
    }

    fn all_terminal(&self) -> bool {
        self.member_states().iter().all(|s| s.is_terminal())
    }
}

/// Derives a batch state from its admitted members.
///
/// - no members: `Rejected`
/// - any member failed: `Failed`, even while others still run
/// - any member not yet terminal: `Running`
/// - every member completed: `Succeeded`
/// - otherwise (some cancelled, none failed): `Cancelled`
pub fn aggregate(states: &[TransferState]) -> BatchState {
    if states.is_empty() {
        return BatchState::Rejected;
    }
    if states.contains(&TransferState::Failed) {
        return BatchState::Failed;
    }
    if states.iter().any(|s| !s.is_terminal()) {
        return BatchState::Running;
    }
    if states.iter().all(|s| *s == TransferState::Completed) {
        return BatchState::Succeeded;
    }
    BatchState::Cancelled
}

/// Tracks batches and the sessions they own.
pub struct BatchOrchestrator {
    batches: Mutex<HashMap<String, BatchRecord>>,
    retention: Duration,
    sweeper_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl BatchOrchestrator {
    /// `retention` is how long a retrieved terminal batch stays queryable.
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(HashMap::new()),
            retention,
            sweeper_stop: Mutex::new(None),
        })
    }

    /// Admits each file independently and records the batch.
    ///
    /// Always returns a batch id, even when nothing was admitted; the
    /// per-file results say which files got a transfer id.
    pub async fn create_batch<F: SessionFactory + ?Sized>(
        &self,
        factory: &F,
        files: &[FileDescriptor],
    ) -> (String, Vec<FileAdmission>) {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut entries = Vec::with_capacity(files.len());
        let mut results = Vec::with_capacity(files.len());

        for (index, file) in files.iter().enumerate() {
            match factory.prepare(file).await {
                Ok(handle) => {
                    results.push(FileAdmission {
                        index,
                        filename: file.filename.clone(),
                        admitted: true,
                        transfer_id: Some(handle.transfer_id().to_string()),
                        destination: handle.destination().map(str::to_string),
                        reason: None,
                    });
                    entries.push(Entry::Member {
                        filename: file.filename.clone(),
                        handle,
                    });
                }
                Err(e) => {
                    debug!(batch_id = %batch_id, index, error = %e, "batch file not admitted");
                    results.push(FileAdmission {
                        index,
                        filename: file.filename.clone(),
                        admitted: false,
                        transfer_id: None,
                        destination: None,
                        reason: Some(e.to_string()),
                    });
                    entries.push(Entry::Rejected {
                        filename: file.filename.clone(),
                    });
                }
            }
        }

        let admitted = results.iter().filter(|r| r.admitted).count();
        info!(batch_id = %batch_id, files = files.len(), admitted, "batch created");
        self.batches.lock().insert(
            batch_id.clone(),
            BatchRecord {
                entries,
                retrieved: None,
            },
        );
        (batch_id, results)
    }

    /// Current status of a batch.
    ///
    /// The first status returned after every member is terminal is
    /// remembered and returned verbatim from then on.
    pub fn status(&self, batch_id: &str) -> Result<BatchStatusResponse, TransferError> {
        let mut batches = self.batches.lock();
        let record = batches
            .get_mut(batch_id)
            .ok_or_else(|| TransferError::UnknownBatch(batch_id.to_string()))?;
        if let Some((frozen, _)) = &record.retrieved {
            return Ok(frozen.clone());
        }
        let snapshot = record.snapshot(batch_id);
        if record.all_terminal() && snapshot.state.is_terminal() {
            record.retrieved = Some((snapshot.clone(), Instant::now()));
        }
        Ok(snapshot)
    }

    /// Transfer ids of members that have not finished.
    pub fn live_members(&self, batch_id: &str) -> Result<Vec<String>, TransferError> {
        let batches = self.batches.lock();
        let record = batches
            .get(batch_id)
            .ok_or_else(|| TransferError::UnknownBatch(batch_id.to_string()))?;
        Ok(record
            .entries
            .iter()
            .filter_map(|e| match e {
                Entry::Member { handle, .. } if !handle.state().is_terminal() => {
                    Some(handle.transfer_id().to_string())
                }
                _ => None,
            })
            .collect())
    }

    /// Forgets a batch. Refused while any member is still running.
    pub fn delete(&self, batch_id: &str) -> Result<(), TransferError> {
        let mut batches = self.batches.lock();
        let record = batches
            .get(batch_id)
            .ok_or_else(|| TransferError::UnknownBatch(batch_id.to_string()))?;
        if !record.all_terminal() {
            return Err(TransferError::ProtocolViolation(format!(
                "batch {batch_id} is still running"
            )));
        }
        batches.remove(batch_id);
        info!(batch_id, "batch deleted");
        Ok(())
    }

    /// Forgets batches whose terminal status was retrieved at least
    /// `retention` ago. Returns how many were dropped.
    pub fn sweep_retrieved(&self) -> usize {
        let mut batches = self.batches.lock();
        let before = batches.len();
        batches.retain(|_, record| {
            !record
                .retrieved
                .as_ref()
                .is_some_and(|(_, at)| at.elapsed() >= self.retention)
        });
        let swept = before - batches.len();
        if swept > 0 {
            debug!(swept, remaining = batches.len(), "retrieved batches swept");
        }
        swept
    }

    /// Runs [`sweep_retrieved`](Self::sweep_retrieved) every `period` in a
    /// background task until [`stop_sweeper`](Self::stop_sweeper).
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) {
        let (tx, mut rx) = oneshot::channel();
        // Replacing the sender stops any previous sweeper.
        *self.sweeper_stop.lock() = Some(tx);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.sweep_retrieved();
                    }
                    _ = &mut rx => break,
                }
            }
            debug!("batch sweeper stopped");
        });
    }

    pub fn stop_sweeper(&self) {
        drop(self.sweeper_stop.lock().take());
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
