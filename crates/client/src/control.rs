//! Control channel: cancellation and batch requests.
//!
//! Request/response with UUID correlation, like every other envelope
//! exchange on the relay.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uplink_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT, WS_REQUEST_TIMEOUT};
use uplink_protocol::messages::{
    BatchCreatedResponse, BatchRequest, BatchStatusResponse, CancelAckResponse,
    CancelTransferRequest, CreateBatchRequest, OperationResult,
};
use uplink_protocol::{FileDescriptor, Message, MessageType};

use crate::ClientError;
use crate::pumps;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Control channel to a relay.
pub struct ControlClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl ControlClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let cancel = CancellationToken::new();
        let (write_tx, read, write_handle) = pumps::connect(url, &cancel).await?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let read_handle = tokio::spawn(read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        Ok(Self {
            write_tx,
            pending,
            cancel,
            read_handle,
            write_handle,
        })
    }

    /// Sends a request and waits for the correlated response.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Relay {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        req: &Req,
        expect: MessageType,
    ) -> Result<Resp, ClientError> {
        let resp = self.send_request(msg_type, Some(req)).await?;
        if resp.msg_type != expect {
            return Err(ClientError::UnexpectedMessage(format!("{:?}", resp.msg_type)));
        }
        Ok(resp.require_payload()?)
    }

    /// Requests cancellation. The ack only says the request was taken; the
    /// outcome arrives on the transfer's own channel.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<CancelAckResponse, ClientError> {
        let req = CancelTransferRequest {
            transfer_id: transfer_id.to_string(),
        };
        self.call(MessageType::CancelTransfer, &req, MessageType::CancelAck)
            .await
    }

    pub async fn create_batch(&self, files: Vec<FileDescriptor>) -> Result<BatchCreatedResponse, ClientError> {
        let req = CreateBatchRequest { files };
        self.call(MessageType::CreateBatch, &req, MessageType::BatchCreated)
            .await
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatusResponse, ClientError> {
        self.call(MessageType::GetBatchStatus, &batch(batch_id), MessageType::BatchStatus)
            .await
    }

    pub async fn cancel_batch(&self, batch_id: &str) -> Result<OperationResult, ClientError> {
        self.call(MessageType::CancelBatch, &batch(batch_id), MessageType::OperationResult)
            .await
    }

    pub async fn delete_batch(&self, batch_id: &str) -> Result<OperationResult, ClientError> {
        self.call(MessageType::DeleteBatch, &batch(batch_id), MessageType::OperationResult)
            .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let resp = self.send_request::<()>(MessageType::Ping, None).await?;
        if resp.msg_type != MessageType::Pong {
            return Err(ClientError::UnexpectedMessage(format!("{:?}", resp.msg_type)));
        }
        Ok(())
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

fn batch(batch_id: &str) -> BatchRequest {
    BatchRequest {
        batch_id: batch_id.to_string(),
    }
}

/// Routes replies to their pending requests.
async fn read_pump<S>(
    mut read: S,
    pending: Pending,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Any incoming frame pushes the deadline out.
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("pong timeout, closing control channel");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match msg {
                            tungstenite::Message::Text(text) => route_reply(&text, &pending).await,
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Outstanding requests fail with `Closed` instead of waiting out the
    // timeout.
    pending.lock().await.clear();
}

async fn route_reply(text: &str, pending: &Pending) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received reply");

    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => warn!(id = %msg.id, "reply for unknown request, dropping"),
    }
}
