use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming frame).
///
/// Acts as a read deadline on both channel kinds. A transfer channel that
/// goes silent for this long is treated as a transport fault.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings each connection.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum WebSocket message size in bytes (16 MB).
///
/// Must stay above the largest buffer tier plus the chunk frame header.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Chunk size suggested to clients in `transfer_accepted` (1 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Timeout for control request/response round trips.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Transfer channel (client -> server)
    #[serde(rename = "init_transfer")]
    InitTransfer,
    #[serde(rename = "attach_transfer")]
    AttachTransfer,
    #[serde(rename = "end_of_stream")]
    EndOfStream,

    // Transfer channel (server -> client)
    #[serde(rename = "transfer_accepted")]
    TransferAccepted,

    // Control channel requests
    #[serde(rename = "cancel_transfer")]
    CancelTransfer,
    #[serde(rename = "create_batch")]
    CreateBatch,
    #[serde(rename = "get_batch_status")]
    GetBatchStatus,
    #[serde(rename = "cancel_batch")]
    CancelBatch,
    #[serde(rename = "delete_batch")]
    DeleteBatch,
    #[serde(rename = "ping")]
    Ping,

    // Control channel responses
    #[serde(rename = "cancel_ack")]
    CancelAck,
    #[serde(rename = "batch_created")]
    BatchCreated,
    #[serde(rename = "batch_status")]
    BatchStatus,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// Returns `true` for the messages that open a transfer channel.
    pub fn opens_transfer_channel(&self) -> bool {
        matches!(self, MessageType::InitTransfer | MessageType::AttachTransfer)
    }
}
