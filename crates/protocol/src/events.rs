//! Events the server pushes on a transfer channel.
//!
//! These are not wrapped in the [`Message`](crate::Message) envelope: each
//! text frame is exactly `{"type": ..., "value": ...}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TransferEvent {
    /// Percent complete, `0.0..=100.0`.
    Progress(f64),
    /// Terminal: the sink committed the object; carries its reference.
    Success(String),
    /// Terminal: the transfer failed.
    Error(String),
    /// Terminal: the transfer was cancelled as requested.
    Cancelled,
}

impl TransferEvent {
    /// Returns `true` for success, error and cancelled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_shape() {
        let json = serde_json::to_string(&TransferEvent::Progress(42.5)).unwrap();
        assert_eq!(json, r#"{"type":"progress","value":42.5}"#);
    }

    #[test]
    fn cancelled_has_no_value() {
        let json = serde_json::to_string(&TransferEvent::Cancelled).unwrap();
        assert_eq!(json, r#"{"type":"cancelled"}"#);
        let back: TransferEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransferEvent::Cancelled);
    }

    #[test]
    fn error_carries_message() {
        let ev: TransferEvent =
            serde_json::from_str(r#"{"type":"error","value":"sink rejected write"}"#).unwrap();
        assert_eq!(ev, TransferEvent::Error("sink rejected write".into()));
        assert!(ev.is_terminal());
    }

    #[test]
    fn progress_is_not_terminal() {
        assert!(!TransferEvent::Progress(100.0).is_terminal());
        assert!(TransferEvent::Success("obj-1".into()).is_terminal());
    }
}
