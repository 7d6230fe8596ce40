use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uplink_protocol::messages::{BatchStatusResponse, FileAdmission};
use uplink_protocol::{CancelStatus, FileDescriptor, TransferEvent};
use uuid::Uuid;

use crate::TransferError;
use crate::admission::{AdmissionController, AdmissionStats};
use crate::batch::{BatchOrchestrator, PrepareFuture, SessionFactory};
use crate::cancel::CancellationCoordinator;
use crate::config::{SessionConfig, TransferConfig};
use crate::memory::{CachedSampler, MemorySampler, SystemMemorySampler};
use crate::pool::{BufferPool, PoolStats};
use crate::session::{Inbound, TransferHandle, TransferSession};
use crate::sink::RemoteSink;
use crate::validation::validate_object_name;

/// Point-in-time counters across the relay.
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub admission: AdmissionStats,
    pub pool: PoolStats,
    pub active_sessions: usize,
    pub batches: usize,
    pub forced_teardowns: u64,
    pub reaped: u64,
}

struct RelayInner {
    session_config: SessionConfig,
    admission: AdmissionController,
    pool: Arc<BufferPool>,
    sink: Arc<dyn RemoteSink>,
    coordinator: Arc<CancellationCoordinator>,
    batches: Arc<BatchOrchestrator>,
}

impl RelayInner {
    async fn prepare_file(&self, file: &FileDescriptor) -> Result<Arc<TransferHandle>, TransferError> {
        validate_object_name(&file.filename)?;

        let transfer_id = Uuid::new_v4().to_string();
        let handle = TransferHandle::new(transfer_id.clone(), file.clone());

        let admission = self.admission.clone();
        let id = transfer_id.clone();
        let declared_size = file.declared_size;
        let slot = tokio::task::spawn_blocking(move || admission.try_admit(&id, declared_size))
            .await
            .map_err(|e| TransferError::MemorySample(format!("admission task failed: {e}")))??;

        // The slot is released on the error path when it goes out of scope.
        let writer = match self.sink.open(&transfer_id, file).await {
            Ok(w) => w,
            Err(e) => {
                warn!(transfer_id = %transfer_id, error = %e, "sink refused object");
                return Err(e.into());
            }
        };
        let destination = writer.destination().to_string();
        handle.admit(slot, writer);
        self.coordinator.register(handle.clone());

        info!(
            transfer_id = %transfer_id,
            declared_size,
            filename = %file.filename,
            destination = %destination,
            "transfer prepared"
        );
        Ok(handle)
    }
}

impl SessionFactory for RelayInner {
    fn prepare<'a>(&'a self, file: &'a FileDescriptor) -> PrepareFuture<'a> {
        Box::pin(self.prepare_file(file))
    }
}

/// Entry point of the transfer core: wires admission, buffers, sink,
/// cancellation and batches together.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(
        config: &TransferConfig,
        sampler: Arc<dyn MemorySampler>,
        sink: Arc<dyn RemoteSink>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        let policy = config.admission_policy();
        info!(
            tier = config.tier.as_str(),
            max_usage_percent = policy.max_usage_percent,
            reserved_bytes = policy.reserved_bytes,
            footprint_percent = policy.footprint_percent,
            resident_buffer_bound = config.pool.resident_bound_bytes(),
            "relay configured"
        );
        Ok(Self {
            inner: Arc::new(RelayInner {
                session_config: config.session.clone(),
                admission: AdmissionController::new(policy, sampler),
                pool: BufferPool::new(&config.pool),
                sink,
                coordinator: CancellationCoordinator::new(&config.session),
                batches: BatchOrchestrator::new(config.session.terminal_retention()),
            }),
        })
    }

    /// Like [`new`](Self::new), sampling the host's memory through a short
    /// cache.
    pub fn with_system_memory(
        config: &TransferConfig,
        sink: Arc<dyn RemoteSink>,
    ) -> Result<Self, TransferError> {
        let sampler = CachedSampler::new(SystemMemorySampler::new(), config.sample_ttl());
        Self::new(config, Arc::new(sampler), sink)
    }

    /// Starts background maintenance: the idle reaper and the sweep of
    /// retrieved batches.
    pub fn start(&self) {
        self.inner.coordinator.start_reaper();
        self.inner
            .batches
            .start_sweeper(self.inner.session_config.reap_interval());
    }

    /// Stops background maintenance and cancels every live transfer.
    pub fn shutdown(&self) -> usize {
        self.inner.coordinator.stop_reaper();
        self.inner.batches.stop_sweeper();
        self.inner.coordinator.cancel_all()
    }

    /// Admits a file and opens its sink object. The transfer then waits,
    /// counting toward the idle timeout, until [`attach`](Self::attach).
    pub async fn prepare(&self, file: &FileDescriptor) -> Result<Arc<TransferHandle>, TransferError> {
        self.inner.prepare_file(file).await
    }

    /// Binds a prepared transfer to a channel and starts its worker.
    ///
    /// Events go to `events`; chunk frames and the sentinel are fed through
    /// the returned sender. A transfer can be attached once.
    pub fn attach(
        &self,
        transfer_id: &str,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<(Arc<TransferHandle>, mpsc::Sender<Inbound>), TransferError> {
        let handle = self
            .inner
            .coordinator
            .get(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        let writer = handle.attach(events)?;

        let (tx, rx) = mpsc::channel(self.inner.session_config.inbound_queue);
        let session = TransferSession::new(
            handle.clone(),
            writer,
            self.inner.pool.clone(),
            &self.inner.session_config,
        );
        let task = tokio::spawn(session.run(rx));
        handle.set_worker(task.abort_handle());
        info!(transfer_id, "transfer attached");
        Ok((handle, tx))
    }

    /// [`prepare`](Self::prepare) followed by [`attach`](Self::attach).
    pub async fn open(
        &self,
        file: &FileDescriptor,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<(Arc<TransferHandle>, mpsc::Sender<Inbound>), TransferError> {
        let handle = self.prepare(file).await?;
        self.attach(handle.transfer_id(), events)
    }

    /// Out-of-band cancellation; see [`CancellationCoordinator::request_cancel`].
    pub fn request_cancel(&self, transfer_id: &str) -> CancelStatus {
        self.inner.coordinator.request_cancel(transfer_id)
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<Arc<TransferHandle>> {
        self.inner.coordinator.get(transfer_id)
    }

    pub async fn create_batch(&self, files: &[FileDescriptor]) -> (String, Vec<FileAdmission>) {
        self.inner.batches.create_batch(&*self.inner, files).await
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatusResponse, TransferError> {
        self.inner.batches.status(batch_id)
    }

    /// Requests cancellation of every unfinished member. Returns how many
    /// requests were accepted.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize, TransferError> {
        let members = self.inner.batches.live_members(batch_id)?;
        let accepted = members
            .iter()
            .filter(|id| self.request_cancel(id) == CancelStatus::Accepted)
            .count();
        info!(batch_id, members = members.len(), accepted, "batch cancellation requested");
        Ok(accepted)
    }

    pub fn delete_batch(&self, batch_id: &str) -> Result<(), TransferError> {
        self.inner.batches.delete(batch_id)
    }

    /// Chunk size suggested to clients.
    pub fn chunk_size(&self) -> usize {
        self.inner.session_config.chunk_size
    }

    /// Largest chunk payload accepted.
    pub fn max_chunk_size(&self) -> usize {
        self.inner.pool.max_buffer_size()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.inner.coordinator
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            admission: self.inner.admission.stats(),
            pool: self.inner.pool.stats(),
            active_sessions: self.inner.coordinator.active_count(),
            batches: self.inner.batches.len(),
            forced_teardowns: self.inner.coordinator.forced_total(),
            reaped: self.inner.coordinator.reaped_total(),
        }
    }
}
