//! Maps protocol messages onto the [`Relay`] and its replies back onto
//! the wire.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uplink_protocol::messages::{
    AttachTransferRequest, BatchCreatedResponse, BatchRequest, CancelAckResponse,
    CancelTransferRequest, CreateBatchRequest, InitTransferRequest, OperationResult,
    TransferAcceptedResponse,
};
use uplink_protocol::{Message, MessageType};
use uplink_transfer::{Inbound, Relay, TransferError};

use crate::connection::{Sender, spawn_event_forwarder};

/// A transfer bound to a channel.
pub(crate) struct OpenedTransfer {
    pub transfer_id: String,
    pub inbound: mpsc::Sender<Inbound>,
}

/// Serves protocol requests against one [`Relay`].
pub struct RelayHandler {
    relay: Relay,
}

impl RelayHandler {
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Handles `init_transfer` / `attach_transfer`.
    ///
    /// On success the transfer is running, `transfer_accepted` is queued and
    /// an event forwarder owns the outbound side of the channel. On failure
    /// the error reply is queued and `None` is returned.
    pub(crate) async fn open_transfer(&self, sender: &Sender, msg: &Message) -> Option<OpenedTransfer> {
        let transfer_id = match msg.msg_type {
            MessageType::InitTransfer => {
                let req: InitTransferRequest = decode(sender, msg)?;
                match self.relay.prepare(&req).await {
                    Ok(handle) => handle.transfer_id().to_string(),
                    Err(e) => {
                        reply_transfer_error(sender, msg, &e);
                        return None;
                    }
                }
            }
            MessageType::AttachTransfer => decode::<AttachTransferRequest>(sender, msg)?.transfer_id,
            _ => return None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, inbound) = match self.relay.attach(&transfer_id, events_tx) {
            Ok(attached) => attached,
            Err(e) => {
                reply_transfer_error(sender, msg, &e);
                return None;
            }
        };

        let accepted = TransferAcceptedResponse {
            transfer_id: transfer_id.clone(),
            destination: handle.destination().unwrap_or_default().to_string(),
            chunk_size: self.relay.chunk_size(),
            max_chunk_size: self.relay.max_chunk_size(),
        };
        let delivered = match msg.reply(MessageType::TransferAccepted, Some(&accepted)) {
            Ok(reply) => sender.deliver(&reply).await.is_ok(),
            Err(e) => {
                error!("failed to encode transfer_accepted: {e}");
                false
            }
        };
        if !delivered {
            // Nobody will ever stream into it.
            self.relay.request_cancel(&transfer_id);
            return None;
        }

        spawn_event_forwarder(transfer_id.clone(), events_rx, sender.clone());
        Some(OpenedTransfer {
            transfer_id,
            inbound,
        })
    }

    /// Dispatches a control-channel request.
    pub(crate) async fn dispatch_control(&self, sender: &Sender, msg: Message) {
        match msg.msg_type {
            MessageType::CancelTransfer => self.on_cancel_transfer(sender, &msg),
            MessageType::CreateBatch => self.on_create_batch(sender, &msg).await,
            MessageType::GetBatchStatus => self.on_get_batch_status(sender, &msg),
            MessageType::CancelBatch => self.on_cancel_batch(sender, &msg),
            MessageType::DeleteBatch => self.on_delete_batch(sender, &msg),
            MessageType::Ping => {
                if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                    let _ = sender.send_msg(reply);
                }
            }
            MessageType::InitTransfer | MessageType::AttachTransfer => {
                let _ = sender.send_error(&msg, 400, "transfers need their own channel");
            }
            _ => {
                warn!(msg_type = ?msg.msg_type, "unhandled message type");
                let _ = sender.send_error(&msg, 400, "unexpected message type");
            }
        }
    }

    fn on_cancel_transfer(&self, sender: &Sender, msg: &Message) {
        let Some(req) = decode::<CancelTransferRequest>(sender, msg) else {
            return;
        };
        let status = self.relay.request_cancel(&req.transfer_id);
        let ack = CancelAckResponse {
            transfer_id: req.transfer_id,
            status,
        };
        reply(sender, msg, MessageType::CancelAck, &ack);
    }

    async fn on_create_batch(&self, sender: &Sender, msg: &Message) {
        let Some(req) = decode::<CreateBatchRequest>(sender, msg) else {
            return;
        };
        let (batch_id, results) = self.relay.create_batch(&req.files).await;
        reply(
            sender,
            msg,
            MessageType::BatchCreated,
            &BatchCreatedResponse { batch_id, results },
        );
    }

    fn on_get_batch_status(&self, sender: &Sender, msg: &Message) {
        let Some(req) = decode::<BatchRequest>(sender, msg) else {
            return;
        };
        match self.relay.batch_status(&req.batch_id) {
            Ok(status) => reply(sender, msg, MessageType::BatchStatus, &status),
            Err(e) => reply_transfer_error(sender, msg, &e),
        }
    }

    fn on_cancel_batch(&self, sender: &Sender, msg: &Message) {
        let Some(req) = decode::<BatchRequest>(sender, msg) else {
            return;
        };
        match self.relay.cancel_batch(&req.batch_id) {
            Ok(accepted) => {
                let result = OperationResult {
                    success: true,
                    message: format!("cancellation requested for {accepted} transfer(s)"),
                };
                reply(sender, msg, MessageType::OperationResult, &result);
            }
            Err(e) => reply_transfer_error(sender, msg, &e),
        }
    }

    fn on_delete_batch(&self, sender: &Sender, msg: &Message) {
        let Some(req) = decode::<BatchRequest>(sender, msg) else {
            return;
        };
        match self.relay.delete_batch(&req.batch_id) {
            Ok(()) => {
                let result = OperationResult {
                    success: true,
                    message: String::new(),
                };
                reply(sender, msg, MessageType::OperationResult, &result);
            }
            Err(e) => reply_transfer_error(sender, msg, &e),
        }
    }
}

/// Decodes the request payload, replying 400 when it does not fit.
fn decode<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.require_payload::<T>() {
        Ok(req) => Some(req),
        Err(e) => {
            let _ = sender.send_error(msg, 400, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn reply<T: Serialize>(sender: &Sender, req: &Message, msg_type: MessageType, payload: &T) {
    match req.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => {
            error!("failed to encode reply: {e}");
            let _ = sender.send_error(req, 500, "failed to encode reply");
        }
    }
}

fn reply_transfer_error(sender: &Sender, req: &Message, err: &TransferError) {
    let _ = sender.send_error(req, err.code(), &err.to_string());
}
