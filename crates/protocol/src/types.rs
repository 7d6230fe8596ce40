use serde::{Deserialize, Serialize};

/// Lifecycle state of one transfer session.
///
/// `Pending -> Admitted -> Streaming -> {Completed | Failed | Cancelled}`.
/// A session may also jump straight from `Admitted` to a terminal state
/// (cancelled or reaped before its first chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Admitted,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// State of one file inside a batch: either a member's session state or
/// `Rejected` when admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Rejected,
    Pending,
    Admitted,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl From<TransferState> for FileState {
    fn from(state: TransferState) -> Self {
        match state {
            TransferState::Pending => FileState::Pending,
            TransferState::Admitted => FileState::Admitted,
            TransferState::Streaming => FileState::Streaming,
            TransferState::Completed => FileState::Completed,
            TransferState::Failed => FileState::Failed,
            TransferState::Cancelled => FileState::Cancelled,
        }
    }
}

/// Aggregated state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// At least one member has not reached a terminal state.
    Running,
    /// Every member completed.
    Succeeded,
    /// At least one member failed.
    Failed,
    /// No member failed and at least one was cancelled.
    Cancelled,
    /// No file of the batch was admitted.
    Rejected,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchState::Running)
    }
}

/// What happened to a cancel request at the moment it was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    /// Cancellation was requested; completion arrives on the transfer channel.
    Accepted,
    /// The transfer had already reached a terminal state.
    AlreadyTerminal,
    /// No transfer with that id is known.
    Unknown,
}
