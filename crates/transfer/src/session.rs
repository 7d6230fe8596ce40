//! One transfer: the shared [`TransferHandle`] and the [`TransferSession`]
//! worker that drives it.
//!
//! The handle is what everyone else sees (coordinator, batches, the
//! connection that attached to it). The worker owns the sink writer and
//! consumes [`Inbound`] frames in order. Whoever reaches a terminal state
//! first wins: [`TransferHandle::finish`] latches the state under a lock,
//! sends the one terminal event, and releases the admission slot and
//! writer. Every later attempt is a no-op.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uplink_protocol::{FileDescriptor, TransferEvent, TransferState, parse_chunk_frame};

use crate::TransferError;
use crate::admission::ActiveSlot;
use crate::config::SessionConfig;
use crate::pool::BufferPool;
use crate::progress::ProgressThrottle;
use crate::sink::SinkWriter;

/// What the transport hands to a session worker, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    /// A raw binary chunk frame.
    Chunk(Vec<u8>),
    /// The end-of-stream sentinel.
    EndOfStream,
    /// A frame the transport could not interpret.
    Malformed(String),
    /// The channel went away before the sentinel.
    Closed(String),
}

/// How a session ended.
#[derive(Debug)]
pub enum Outcome {
    /// The sink committed the object; carries its reference.
    Completed(String),
    Failed(TransferError),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> TransferState {
        match self {
            Outcome::Completed(_) => TransferState::Completed,
            Outcome::Failed(_) => TransferState::Failed,
            Outcome::Cancelled => TransferState::Cancelled,
        }
    }

    fn event(&self) -> TransferEvent {
        match self {
            Outcome::Completed(reference) => TransferEvent::Success(reference.clone()),
            Outcome::Failed(e) => TransferEvent::Error(e.to_string()),
            Outcome::Cancelled => TransferEvent::Cancelled,
        }
    }
}

/// Shared view of one transfer.
pub struct TransferHandle {
    transfer_id: String,
    file: FileDescriptor,
    destination: OnceLock<String>,
    state: Mutex<TransferState>,
    cancel_requested: AtomicBool,
    cancel: CancellationToken,
    terminal: watch::Sender<Option<TransferState>>,
    finished_at: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
    bytes_received: AtomicU64,
    attached: AtomicBool,
    slot: Mutex<Option<ActiveSlot>>,
    writer: Mutex<Option<Box<dyn SinkWriter>>>,
    worker: Mutex<Option<AbortHandle>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransferEvent>>>,
}

impl TransferHandle {
    pub(crate) fn new(transfer_id: String, file: FileDescriptor) -> Arc<Self> {
        Arc::new(Self {
            transfer_id,
            file,
            destination: OnceLock::new(),
            state: Mutex::new(TransferState::Pending),
            cancel_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            terminal: watch::Sender::new(None),
            finished_at: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            bytes_received: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            slot: Mutex::new(None),
            writer: Mutex::new(None),
            worker: Mutex::new(None),
            events: Mutex::new(None),
        })
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn declared_size(&self) -> u64 {
        self.file.declared_size
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Sink destination handle, once admitted.
    pub fn destination(&self) -> Option<&str> {
        self.destination.get().map(String::as_str)
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Time since the last chunk, attach or admission.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since the terminal transition, if there was one.
    pub fn finished_for(&self) -> Option<Duration> {
        self.finished_at.lock().map(|at| at.elapsed())
    }

    /// Holds the slot and writer until the session ends.
    pub(crate) fn admit(&self, slot: ActiveSlot, writer: Box<dyn SinkWriter>) {
        let mut state = self.state.lock();
        if *state != TransferState::Pending {
            return;
        }
        let _ = self.destination.set(writer.destination().to_string());
        *self.slot.lock() = Some(slot);
        *self.writer.lock() = Some(writer);
        *state = TransferState::Admitted;
        drop(state);
        self.touch();
    }

    /// Binds an event channel and hands out the sink writer. Succeeds once.
    pub(crate) fn attach(
        &self,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Box<dyn SinkWriter>, TransferError> {
        let state = self.state.lock();
        if state.is_terminal() {
            return Err(TransferError::ProtocolViolation(format!(
                "transfer {} already finished as {:?}",
                self.transfer_id, *state
            )));
        }
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyAttached(self.transfer_id.clone()));
        }
        let writer = self.writer.lock().take().ok_or_else(|| {
            TransferError::ProtocolViolation(format!(
                "transfer {} has no open sink object",
                self.transfer_id
            ))
        })?;
        *self.events.lock() = Some(events);
        drop(state);
        self.touch();
        Ok(writer)
    }

    pub(crate) fn set_worker(&self, worker: AbortHandle) {
        let state = self.state.lock();
        if state.is_terminal() {
            drop(state);
            worker.abort();
            return;
        }
        *self.worker.lock() = Some(worker);
    }

    /// Flags the session for cooperative cancellation. Returns `true` only
    /// for the call that set the flag.
    pub fn request_cancel(&self) -> bool {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn mark_streaming(&self) {
        let mut state = self.state.lock();
        if *state == TransferState::Admitted {
            *state = TransferState::Streaming;
        }
    }

    fn emit_progress(&self, percent: f64) {
        let state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(TransferEvent::Progress(percent));
        }
    }

    /// Moves the session to its terminal state.
    ///
    /// Returns `false` if another path got there first; in that case
    /// nothing is emitted or released.
    pub fn finish(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        let new_state = outcome.state();
        *state = new_state;
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(outcome.event());
        }
        let slot = self.slot.lock().take();
        let writer = self.writer.lock().take();
        self.worker.lock().take();
        *self.finished_at.lock() = Some(Instant::now());
        drop(state);

        drop(slot);
        drop(writer);
        self.terminal.send_replace(Some(new_state));

        let bytes = self.bytes_received();
        match &outcome {
            Outcome::Completed(reference) => {
                info!(transfer_id = %self.transfer_id, bytes, reference = %reference, "transfer completed")
            }
            Outcome::Failed(e) => {
                warn!(transfer_id = %self.transfer_id, bytes, error = %e, "transfer failed")
            }
            Outcome::Cancelled => info!(transfer_id = %self.transfer_id, bytes, "transfer cancelled"),
        }
        true
    }

    /// Stops the worker without waiting for it, then finishes with
    /// `outcome`.
    pub fn force_teardown(&self, outcome: Outcome) -> bool {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.finish(outcome)
    }

    /// Resolves once the session is terminal.
    pub async fn wait_terminal(&self) -> TransferState {
        let mut rx = self.terminal.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(TransferState::Failed),
            Err(_) => self.state(),
        }
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("transfer_id", &self.transfer_id)
            .field("state", &self.state())
            .field("bytes_received", &self.bytes_received())
            .field("declared_size", &self.file.declared_size)
            .finish()
    }
}

/// Worker that streams one transfer's chunks into its sink.
pub struct TransferSession {
    handle: Arc<TransferHandle>,
    writer: Box<dyn SinkWriter>,
    pool: Arc<BufferPool>,
    throttle: ProgressThrottle,
    next_seq: u64,
    bytes_received: u64,
}

impl TransferSession {
    pub fn new(
        handle: Arc<TransferHandle>,
        writer: Box<dyn SinkWriter>,
        pool: Arc<BufferPool>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            handle,
            writer,
            pool,
            throttle: ProgressThrottle::new(
                config.progress_step_percent,
                config.progress_interval(),
            ),
            next_seq: 0,
            bytes_received: 0,
        }
    }

    /// Consumes `inbound` until the session ends and returns its terminal
    /// state.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) -> TransferState {
        let outcome = self.drive(&mut inbound).await;
        if !matches!(outcome, Outcome::Completed(_)) {
            if let Err(e) = self.writer.abort().await {
                warn!(transfer_id = %self.handle.transfer_id, error = %e, "failed to discard partial object");
            }
        }
        self.handle.finish(outcome);
        self.handle.state()
    }

    /// Frames queued behind the end-of-stream sentinel fail the transfer;
    /// anything sent after the session has finished is never read.
    async fn drive(&mut self, inbound: &mut mpsc::Receiver<Inbound>) -> Outcome {
        loop {
            if self.handle.cancel_requested() {
                return Outcome::Cancelled;
            }

            let next = tokio::select! {
                biased;
                _ = self.handle.cancelled() => continue,
                next = inbound.recv() => next,
            };

            // Cancellation is checked again before any byte is handled so a
            // chunk that raced the request is never written.
            if self.handle.cancel_requested() {
                return Outcome::Cancelled;
            }

            match next {
                Some(Inbound::Chunk(raw)) => {
                    self.handle.touch();
                    if let Err(e) = self.handle_chunk(&raw).await {
                        return Outcome::Failed(e);
                    }
                }
                Some(Inbound::EndOfStream) => {
                    if let Ok(extra) = inbound.try_recv() {
                        match extra {
                            Inbound::Chunk(_) => {
                                return Outcome::Failed(TransferError::ProtocolViolation(
                                    "chunk after end-of-stream".into(),
                                ));
                            }
                            Inbound::EndOfStream => {
                                return Outcome::Failed(TransferError::ProtocolViolation(
                                    "duplicate end-of-stream".into(),
                                ));
                            }
                            Inbound::Malformed(reason) => {
                                return Outcome::Failed(TransferError::ProtocolViolation(reason));
                            }
                            Inbound::Closed(_) => {}
                        }
                    }
                    return match self.handle_end_of_stream().await {
                        Ok(reference) => Outcome::Completed(reference),
                        Err(e) => Outcome::Failed(e),
                    };
                }
                Some(Inbound::Malformed(reason)) => {
                    return Outcome::Failed(TransferError::ProtocolViolation(reason));
                }
                Some(Inbound::Closed(reason)) => {
                    return Outcome::Failed(TransferError::TransportFault(reason));
                }
                None => {
                    return Outcome::Failed(TransferError::TransportFault(
                        "transfer channel closed".into(),
                    ));
                }
            }
        }
    }

    /// Validates one chunk frame and forwards its payload to the sink
    /// through a pooled buffer.
    async fn handle_chunk(&mut self, raw: &[u8]) -> Result<(), TransferError> {
        let frame = parse_chunk_frame(raw)
            .map_err(|e| TransferError::ProtocolViolation(format!("malformed chunk: {e}")))?;

        if frame.header.transfer_id != self.handle.transfer_id {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk for transfer {} on channel of {}",
                frame.header.transfer_id, self.handle.transfer_id
            )));
        }
        if frame.header.seq != self.next_seq {
            return Err(TransferError::ProtocolViolation(format!(
                "expected chunk seq {}, got {}",
                self.next_seq, frame.header.seq
            )));
        }
        if frame.payload.is_empty() {
            return Err(TransferError::ProtocolViolation("empty chunk".into()));
        }

        let len = frame.payload.len();
        let total = self.bytes_received + len as u64;
        let declared = self.handle.declared_size();
        if total > declared {
            return Err(TransferError::ProtocolViolation(format!(
                "received {total} bytes, more than the declared {declared}"
            )));
        }

        let mut buf = self.pool.checkout_for(len).ok_or_else(|| {
            TransferError::ProtocolViolation(format!(
                "chunk of {len} bytes exceeds the {} byte limit",
                self.pool.max_buffer_size()
            ))
        })?;
        let filled = buf.fill_from(frame.payload);
        debug_assert!(filled, "checkout_for picked a tier smaller than {len}");

        self.handle.mark_streaming();
        self.writer.write_chunk(&buf).await?;
        drop(buf);

        self.next_seq += 1;
        self.bytes_received = total;
        self.handle.bytes_received.store(total, Ordering::SeqCst);
        self.handle.touch();
        debug!(transfer_id = %self.handle.transfer_id, seq = self.next_seq - 1, bytes = total, "chunk forwarded");

        if let Some(percent) = self.throttle.observe(total, declared) {
            self.handle.emit_progress(percent);
        }
        Ok(())
    }

    /// Checks the byte count and commits the object.
    async fn handle_end_of_stream(&mut self) -> Result<String, TransferError> {
        let declared = self.handle.declared_size();
        if self.bytes_received != declared {
            return Err(TransferError::ProtocolViolation(format!(
                "end-of-stream after {} bytes, declared {declared}",
                self.bytes_received
            )));
        }
        if let Some(percent) = self.throttle.complete() {
            self.handle.emit_progress(percent);
        }
        let reference = self.writer.commit().await?;
        Ok(reference)
    }
}
