use serde::{Deserialize, Serialize};

use crate::types::{BatchState, CancelStatus, FileState};

// ---------------------------------------------------------------------------
// Transfer channel payloads
// ---------------------------------------------------------------------------

/// Describes one file a client wants to push.
///
/// Supplied by the upload-initiation collaborator; the relay only needs
/// these three fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub declared_size: u64,
    #[serde(default)]
    pub content_type: String,
    pub filename: String,
}

/// Opens a transfer channel for a new, single file.
pub type InitTransferRequest = FileDescriptor;

/// Opens a transfer channel for a transfer prepared by `create_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTransferRequest {
    pub transfer_id: String,
}

/// Sent once the transfer is admitted and the sink is ready for chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAcceptedResponse {
    pub transfer_id: String,
    /// Opaque destination handle issued by the remote sink.
    pub destination: String,
    /// Suggested chunk payload size.
    pub chunk_size: usize,
    /// Largest chunk payload the relay accepts.
    pub max_chunk_size: usize,
}

// ---------------------------------------------------------------------------
// Control channel payloads
// ---------------------------------------------------------------------------

/// Out-of-band cancellation of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransferRequest {
    pub transfer_id: String,
}

/// Acknowledges receipt of a cancel request (not its completion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAckResponse {
    pub transfer_id: String,
    pub status: CancelStatus,
}

/// Creates a batch of independently admitted transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub files: Vec<FileDescriptor>,
}

/// Admission outcome for one file of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAdmission {
    pub index: usize,
    pub filename: String,
    pub admitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response to `create_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreatedResponse {
    pub batch_id: String,
    pub results: Vec<FileAdmission>,
}

/// Addresses a batch by id (`get_batch_status`, `cancel_batch`, `delete_batch`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub batch_id: String,
}

/// State of one file within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileStatus {
    pub index: usize,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    pub state: FileState,
}

/// Response to `get_batch_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusResponse {
    pub batch_id: String,
    pub state: BatchState,
    pub files: Vec<BatchFileStatus>,
}

/// Generic result for operations without a dedicated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
