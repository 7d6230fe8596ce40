//! One file over one transfer channel.

use std::path::Path;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uplink_protocol::constants::{WS_PONG_WAIT, WS_REQUEST_TIMEOUT};
use uplink_protocol::messages::{AttachTransferRequest, TransferAcceptedResponse};
use uplink_protocol::{
    ChunkHeader, FileDescriptor, Message, MessageType, TransferEvent, encode_chunk_frame,
};

use crate::ClientError;
use crate::chunks::ChunkReader;
use crate::pumps::{self, WsRead};

/// A transfer channel after the relay accepted it.
///
/// Chunks go out through [`send_chunk`](Self::send_chunk) with increasing
/// sequence numbers; events come back through
/// [`next_event`](Self::next_event).
pub struct TransferClient {
    accepted: TransferAcceptedResponse,
    write_tx: mpsc::Sender<tungstenite::Message>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    next_seq: u64,
    bytes_sent: u64,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl TransferClient {
    /// Opens a channel for a new file (`init_transfer`).
    ///
    /// Fails with [`ClientError::Relay`] if the relay refuses it, e.g. code
    /// 503 when there is no memory headroom.
    pub async fn init(url: &str, file: &FileDescriptor) -> Result<Self, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(id, MessageType::InitTransfer, Some(file))?;
        Self::open(url, msg).await
    }

    /// Opens a channel for a transfer prepared by `create_batch`.
    pub async fn attach(url: &str, transfer_id: &str) -> Result<Self, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let req = AttachTransferRequest {
            transfer_id: transfer_id.to_string(),
        };
        let msg = Message::new(id, MessageType::AttachTransfer, Some(&req))?;
        Self::open(url, msg).await
    }

    async fn open(url: &str, first: Message) -> Result<Self, ClientError> {
        let cancel = CancellationToken::new();
        let (write_tx, read, write_handle) = pumps::connect(url, &cancel).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let read_handle = tokio::spawn(read_pump(
            read,
            reply_tx,
            events_tx,
            write_tx.clone(),
            cancel.clone(),
        ));

        let opened = handshake(&write_tx, &first, reply_rx).await;

        match opened {
            Ok(accepted) => {
                debug!(transfer_id = %accepted.transfer_id, "transfer channel accepted");
                Ok(Self {
                    accepted,
                    write_tx,
                    events,
                    next_seq: 0,
                    bytes_sent: 0,
                    cancel,
                    read_handle,
                    write_handle,
                })
            }
            Err(e) => {
                cancel.cancel();
                Err(e)
            }
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.accepted.transfer_id
    }

    /// Destination handle issued by the relay's sink.
    pub fn destination(&self) -> &str {
        &self.accepted.destination
    }

    /// Chunk size the relay suggests.
    pub fn chunk_size(&self) -> usize {
        self.accepted.chunk_size
    }

    /// Largest chunk the relay accepts.
    pub fn max_chunk_size(&self) -> usize {
        self.accepted.max_chunk_size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Sends the next chunk. Waits while the outbound queue is full.
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let header = ChunkHeader {
            transfer_id: self.accepted.transfer_id.clone(),
            seq: self.next_seq,
        };
        let frame = encode_chunk_frame(&header, data)?;
        self.write_tx
            .send(tungstenite::Message::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::Closed)?;
        self.next_seq += 1;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Sends the end-of-stream sentinel.
    pub async fn finish(&self) -> Result<(), ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let json = serde_json::to_string(&Message::end_of_stream(id))?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Next event from the relay; `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Skips progress events and returns the terminal one.
    pub async fn wait_terminal(&mut self) -> Result<TransferEvent, ClientError> {
        while let Some(event) = self.next_event().await {
            if event.is_terminal() {
                return Ok(event);
            }
        }
        Err(ClientError::Closed)
    }

    /// Streams the file at `path` and waits for the outcome. Returns the
    /// sink reference on success.
    pub async fn stream_file(&mut self, path: &Path) -> Result<String, ClientError> {
        let mut reader = ChunkReader::open(path, self.chunk_size()).await?;
        while let Some(chunk) = reader.next_chunk().await? {
            self.send_chunk(&chunk).await?;
        }
        self.finish().await?;

        match self.wait_terminal().await? {
            TransferEvent::Success(reference) => Ok(reference),
            TransferEvent::Error(message) => Err(ClientError::TransferFailed(message)),
            TransferEvent::Cancelled => Err(ClientError::Cancelled),
            TransferEvent::Progress(_) => Err(ClientError::UnexpectedMessage("progress".into())),
        }
    }

    /// Uploads a local file as a new transfer.
    pub async fn upload_file(url: &str, path: &Path, content_type: &str) -> Result<String, ClientError> {
        let declared_size = tokio::fs::metadata(path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = FileDescriptor {
            declared_size,
            content_type: content_type.to_string(),
            filename,
        };
        let mut client = Self::init(url, &file).await?;
        let result = client.stream_file(path).await;
        client.close().await;
        result
    }

    /// Uploads a local file into a transfer prepared by `create_batch`.
    pub async fn upload_attached(url: &str, transfer_id: &str, path: &Path) -> Result<String, ClientError> {
        let mut client = Self::attach(url, transfer_id).await?;
        let result = client.stream_file(path).await;
        client.close().await;
        result
    }

    /// Closes the channel. An unfinished transfer fails on the relay side.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for TransferClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

/// Sends the opening message and waits for `transfer_accepted`.
async fn handshake(
    write_tx: &mpsc::Sender<tungstenite::Message>,
    first: &Message,
    reply_rx: oneshot::Receiver<Message>,
) -> Result<TransferAcceptedResponse, ClientError> {
    let json = serde_json::to_string(first)?;
    write_tx
        .send(tungstenite::Message::Text(json.into()))
        .await
        .map_err(|_| ClientError::Closed)?;
    let reply = match tokio::time::timeout(WS_REQUEST_TIMEOUT, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => return Err(ClientError::Closed),
        Err(_) => return Err(ClientError::Timeout),
    };
    if let Some(err) = reply.error {
        return Err(ClientError::Relay {
            code: err.code,
            message: err.message,
        });
    }
    if reply.msg_type != MessageType::TransferAccepted {
        return Err(ClientError::UnexpectedMessage(format!("{:?}", reply.msg_type)));
    }
    Ok(reply.require_payload::<TransferAcceptedResponse>()?)
}

/// Routes the reply to the opening message, then every later text frame
/// as a [`TransferEvent`].
async fn read_pump(
    mut read: WsRead,
    reply_tx: oneshot::Sender<Message>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut reply_tx = Some(reply_tx);
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("relay silent past pong deadline, closing");
                break;
            }

            frame = read.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => {
                        if let Some(tx) = reply_tx.take() {
                            match serde_json::from_str::<Message>(&text) {
                                Ok(reply) => {
                                    let _ = tx.send(reply);
                                }
                                Err(e) => {
                                    warn!("unparseable reply: {e}");
                                    break;
                                }
                            }
                            continue;
                        }
                        match serde_json::from_str::<TransferEvent>(&text) {
                            Ok(event) => {
                                trace!(?event, "transfer event");
                                let _ = events_tx.send(event);
                            }
                            Err(e) => warn!("unparseable event: {e}"),
                        }
                    }
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("relay closed the transfer channel");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
