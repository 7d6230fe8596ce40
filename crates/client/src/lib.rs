//! Client side of the uplink relay protocol.
//!
//! [`TransferClient`] pushes one file over its own transfer channel;
//! [`ControlClient`] carries cancellation and batch requests, correlating
//! each reply by message id.

mod chunks;
mod control;
mod pumps;
mod transfer;

pub use chunks::ChunkReader;
pub use control::ControlClient;
pub use transfer::TransferClient;

use tokio_tungstenite::tungstenite;

/// Errors from the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("relay error {code}: {message}")]
    Relay { code: i32, message: String },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl ClientError {
    /// `true` when the relay turned the transfer away for lack of memory;
    /// the same request may succeed later.
    pub fn is_admission_denied(&self) -> bool {
        matches!(self, ClientError::Relay { code: 503, .. })
    }
}
