//! Memory-aware streaming core of the uplink relay.
//!
//! A transfer is admitted against a live memory budget, streamed chunk by
//! chunk through pooled buffers into a [`RemoteSink`], and can be cancelled
//! out-of-band at any time. Nothing here knows about sockets: the server
//! crate feeds [`Inbound`] items in and forwards [`TransferEvent`]s out.
//!
//! [`TransferEvent`]: uplink_protocol::TransferEvent

pub mod admission;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod memory;
pub mod pool;
mod progress;
mod relay;
pub mod session;
pub mod sink;
mod validation;

pub use admission::{ActiveSlot, AdmissionController, AdmissionStats};
pub use batch::{BatchOrchestrator, SessionFactory, aggregate};
pub use cancel::CancellationCoordinator;
pub use config::{
    AdmissionOverrides, AdmissionPolicy, BufferTier, DeploymentTier, PoolConfig, SessionConfig,
    TierConfig, TransferConfig,
};
pub use memory::{CachedSampler, MemorySampler, MemorySnapshot, StaticSampler, SystemMemorySampler};
pub use pool::{BufferPool, PoolStats, PooledBuffer, TierStats};
pub use progress::ProgressThrottle;
pub use relay::{Relay, RelayStats};
pub use session::{Inbound, Outcome, TransferHandle, TransferSession};
pub use sink::{FsSink, MemorySink, RemoteSink, SinkError, SinkWriter};
pub use validation::validate_object_name;

/// Errors produced by the transfer core.
///
/// Every variant maps to a numeric wire code via [`code`](Self::code) so
/// the server can put it straight into an error envelope.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("insufficient memory: requested {requested} bytes, headroom {headroom} bytes")]
    AdmissionDenied { requested: u64, headroom: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport fault: {0}")]
    TransportFault(String),

    #[error("sink write failure: {0}")]
    SinkWriteFailure(String),

    #[error("transfer not found: {0}")]
    UnknownTransfer(String),

    #[error("batch not found: {0}")]
    UnknownBatch(String),

    #[error("transfer already attached: {0}")]
    AlreadyAttached(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("memory sample failed: {0}")]
    MemorySample(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransferError {
    /// Numeric code carried in `WsError.code`.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::AdmissionDenied { .. } => 503,
            TransferError::ProtocolViolation(_) | TransferError::InvalidName(_) => 400,
            TransferError::TransportFault(_) => 499,
            TransferError::SinkWriteFailure(_) => 502,
            TransferError::UnknownTransfer(_) | TransferError::UnknownBatch(_) => 404,
            TransferError::AlreadyAttached(_) => 409,
            TransferError::MemorySample(_) | TransferError::InvalidConfig(_) => 500,
        }
    }

    /// Only admission denials are worth retrying as-is; they clear once
    /// memory frees up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::AdmissionDenied { .. })
    }
}
