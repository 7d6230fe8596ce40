//! The remote storage seam.
//!
//! A [`RemoteSink`] opens one [`SinkWriter`] per transfer. The session
//! writes chunks in order and calls [`SinkWriter::commit`] only after the
//! end-of-stream sentinel. A session that fails or is cancelled calls
//! [`SinkWriter::abort`]; a writer dropped without either (a forced
//! teardown) must still be discarded on a best-effort basis. Discarding the
//! partial object is the sink's job, the relay never rolls anything back.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uplink_protocol::FileDescriptor;

use crate::validation::validate_object_name;

/// A boxed future returned by sink methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Errors reported by a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("rejected by sink: {0}")]
    Rejected(String),
}

impl From<SinkError> for crate::TransferError {
    fn from(e: SinkError) -> Self {
        crate::TransferError::SinkWriteFailure(e.to_string())
    }
}

/// Storage backend that receives the relayed bytes.
pub trait RemoteSink: Send + Sync + 'static {
    /// Opens a writer for a new object.
    fn open<'a>(
        &'a self,
        transfer_id: &'a str,
        file: &'a FileDescriptor,
    ) -> SinkFuture<'a, Box<dyn SinkWriter>>;
}

/// One object being written.
pub trait SinkWriter: Send {
    /// Opaque handle identifying where the object is going.
    fn destination(&self) -> &str;

    /// Appends one chunk.
    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> SinkFuture<'a, ()>;

    /// Makes the object durable and returns its final reference.
    fn commit(&mut self) -> SinkFuture<'_, String>;

    /// Discards the partial object.
    fn abort(&mut self) -> SinkFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// Filesystem sink
// ---------------------------------------------------------------------------

/// Writes each transfer to `<root>/<transfer_id>/<filename>`.
///
/// Bytes land in a `.partial` file that is renamed into place on commit and
/// removed on abort. A writer dropped uncommitted removes it from a
/// background task.
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteSink for FsSink {
    fn open<'a>(
        &'a self,
        transfer_id: &'a str,
        file: &'a FileDescriptor,
    ) -> SinkFuture<'a, Box<dyn SinkWriter>> {
        Box::pin(async move {
            validate_object_name(&file.filename)
                .map_err(|e| SinkError::InvalidName(e.to_string()))?;
            validate_object_name(transfer_id)
                .map_err(|e| SinkError::InvalidName(e.to_string()))?;

            let final_path = self.root.join(transfer_id).join(&file.filename);
            let mut partial_name = final_path.clone().into_os_string();
            partial_name.push(".partial");
            let partial_path = PathBuf::from(partial_name);

            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let out = tokio::fs::File::create(&partial_path).await?;
            debug!(path = %partial_path.display(), "sink object opened");

            Ok(Box::new(FsWriter {
                destination: final_path.display().to_string(),
                final_path,
                partial_path,
                file: Some(out),
                settled: false,
            }) as Box<dyn SinkWriter>)
        })
    }
}

struct FsWriter {
    destination: String,
    final_path: PathBuf,
    partial_path: PathBuf,
    file: Option<tokio::fs::File>,
    /// Committed or aborted.
    settled: bool,
}

impl SinkWriter for FsWriter {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| SinkError::Rejected("object already committed".into()))?;
            file.write_all(data).await?;
            Ok(())
        })
    }

    fn commit(&mut self) -> SinkFuture<'_, String> {
        Box::pin(async move {
            let mut file = self
                .file
                .take()
                .ok_or_else(|| SinkError::Rejected("object already committed".into()))?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&self.partial_path, &self.final_path).await?;
            self.settled = true;
            Ok(self.destination.clone())
        })
    }

    fn abort(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if self.settled {
                return Ok(());
            }
            self.settled = true;
            drop(self.file.take());
            match tokio::fs::remove_file(&self.partial_path).await {
                Ok(()) => {
                    debug!(path = %self.partial_path.display(), "partial object discarded");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.file = None;
        let path = std::mem::take(&mut self.partial_path);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { discard_partial(&tokio::fs::remove_file(&path).await, &path) });
            }
            Err(_) => discard_partial(&std::fs::remove_file(&path), &path),
        }
    }
}

fn discard_partial(result: &std::io::Result<()>, path: &Path) {
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to discard partial object");
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    discarded: AtomicUsize,
    aborted: AtomicUsize,
    fail_open: AtomicBool,
    fail_after_chunks: Mutex<Option<usize>>,
    write_delay: Mutex<Option<Duration>>,
}

/// Keeps committed objects in memory. Failures and latency can be injected.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `open` fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes writers reject every chunk after the first `chunks` of an object.
    pub fn fail_writes_after(&self, chunks: Option<usize>) {
        *self.state.fail_after_chunks.lock() = chunks;
    }

    /// Delays every chunk write.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.state.write_delay.lock() = delay;
    }

    /// Committed bytes for `reference`.
    pub fn object(&self, reference: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().get(reference).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.lock().len()
    }

    /// Writers dropped without a commit.
    pub fn discarded(&self) -> usize {
        self.state.discarded.load(Ordering::SeqCst)
    }

    /// Discards that came through an explicit abort rather than a drop.
    pub fn aborted(&self) -> usize {
        self.state.aborted.load(Ordering::SeqCst)
    }
}

impl RemoteSink for MemorySink {
    fn open<'a>(
        &'a self,
        transfer_id: &'a str,
        file: &'a FileDescriptor,
    ) -> SinkFuture<'a, Box<dyn SinkWriter>> {
        Box::pin(async move {
            if self.state.fail_open.load(Ordering::SeqCst) {
                return Err(SinkError::Rejected("sink unavailable".into()));
            }
            validate_object_name(&file.filename)
                .map_err(|e| SinkError::InvalidName(e.to_string()))?;
            Ok(Box::new(MemoryWriter {
                state: self.state.clone(),
                reference: format!("mem://{transfer_id}/{}", file.filename),
                data: Vec::new(),
                chunks: 0,
                settled: false,
            }) as Box<dyn SinkWriter>)
        })
    }
}

struct MemoryWriter {
    state: Arc<MemoryState>,
    reference: String,
    data: Vec<u8>,
    chunks: usize,
    settled: bool,
}

impl SinkWriter for MemoryWriter {
    fn destination(&self) -> &str {
        &self.reference
    }

    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let delay = *self.state.write_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let fail_after = *self.state.fail_after_chunks.lock();
            if fail_after.is_some_and(|n| self.chunks >= n) {
                return Err(SinkError::Rejected("injected write failure".into()));
            }
            self.data.extend_from_slice(data);
            self.chunks += 1;
            Ok(())
        })
    }

    fn commit(&mut self) -> SinkFuture<'_, String> {
        Box::pin(async move {
            if self.settled {
                return Err(SinkError::Rejected("object already closed".into()));
            }
            self.settled = true;
            self.state
                .objects
                .lock()
                .insert(self.reference.clone(), std::mem::take(&mut self.data));
            Ok(self.reference.clone())
        })
    }

    fn abort(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if !self.settled {
                self.settled = true;
                self.data.clear();
                self.state.discarded.fetch_add(1, Ordering::SeqCst);
                self.state.aborted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.settled {
            self.state.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
