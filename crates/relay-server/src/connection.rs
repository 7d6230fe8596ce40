//! Per-connection read/write pumps and channel-mode dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uplink_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use uplink_protocol::{Message, TransferEvent};
use uplink_transfer::Inbound;

use crate::SEND_BUFFER_SIZE;
use crate::handler::RelayHandler;

/// Handle for queueing frames to one connection.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Queues a protocol [`Message`] as JSON text without waiting.
    ///
    /// Fails if the queue is full or the connection is gone.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Queues an error reply for `req`.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Queues a message, waiting for room in the queue.
    pub async fn deliver(&self, msg: &Message) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| SendError)
    }

    /// Queues a transfer event, waiting for room in the queue.
    pub async fn send_event(&self, event: &TransferEvent) -> Result<(), SendError> {
        let json = serde_json::to_string(event).map_err(|_| SendError)?;
        self.tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| SendError)
    }

    /// Queues a close frame behind everything already queued.
    pub async fn close(&self) {
        let _ = self.tx.send(WsMessage::Close(None)).await;
    }

    /// Returns `true` if the connection is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when a frame cannot be queued.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// What the connection turned into after its first message.
enum Mode {
    Undecided,
    Control,
    Transfer {
        transfer_id: String,
        inbound: mpsc::Sender<Inbound>,
    },
    /// Refused; waiting for the peer to acknowledge the close frame.
    Closing,
}

struct Connection {
    peer: SocketAddr,
    sender: Sender,
    handler: Arc<RelayHandler>,
    cancel: CancellationToken,
    mode: Mode,
}

/// Serves one upgraded WebSocket until either side closes it.
pub(crate) async fn serve_connection<S>(
    ws_stream: S,
    peer: SocketAddr,
    handler: Arc<RelayHandler>,
    server_cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let (ws_sink, ws_stream) = ws_stream.split();

    let writer = tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let mut conn = Connection {
        peer,
        sender: Sender { tx },
        handler,
        cancel: cancel.clone(),
        mode: Mode::Undecided,
    };
    let reason = conn.read_pump(ws_stream).await;
    conn.hang_up(&reason);

    cancel.cancel();
    let _ = writer.await;
    info!(%peer, reason = %reason, "connection closed");
}

/// Forwards a session's events to its channel, then closes the channel
/// after the terminal one.
pub(crate) fn spawn_event_forwarder(
    transfer_id: String,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    sender: Sender,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            if sender.send_event(&event).await.is_err() {
                debug!(transfer_id = %transfer_id, "channel gone, dropping events");
                return;
            }
            if terminal {
                break;
            }
        }
        sender.close().await;
    });
}

/// Write pump: drains the send queue and pings periodically.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        let closing = matches!(ws_msg, WsMessage::Close(_));
                        if let Err(e) = sink.send(ws_msg).await {
                            debug!("write pump send error: {e}");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

impl Connection {
    /// Reads frames until the connection ends and returns why it ended.
    async fn read_pump<S>(&mut self, mut stream: S) -> String
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Send
            + Unpin,
    {
        let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
        pong_deadline.reset();
        let mut heard_from_peer = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return "server shutting down".into(),

                _ = pong_deadline.tick() => {
                    if !heard_from_peer {
                        warn!(peer = %self.peer, "pong timeout, closing connection");
                        return "pong timeout".into();
                    }
                    heard_from_peer = false;
                }

                frame = stream.next() => {
                    let ws_msg = match frame {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            debug!(peer = %self.peer, "read pump error: {e}");
                            return format!("read error: {e}");
                        }
                        None => return "stream ended".into(),
                    };
                    heard_from_peer = true;
                    pong_deadline.reset();

                    match ws_msg {
                        WsMessage::Text(text) => {
                            if text.len() > WS_MAX_MESSAGE_SIZE {
                                error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                continue;
                            }
                            self.on_text(text.as_str()).await;
                        }
                        WsMessage::Binary(data) => self.on_binary(data.to_vec()).await,
                        WsMessage::Ping(data) => {
                            let _ = self.sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Pong(_) => {}
                        WsMessage::Close(_) => return "closed by peer".into(),
                        WsMessage::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                match &self.mode {
                    Mode::Transfer { inbound, .. } => {
                        let item = Inbound::Malformed(format!("invalid message JSON: {e}"));
                        self.forward(inbound, item).await;
                    }
                    _ => error!(peer = %self.peer, "invalid message JSON: {e}"),
                }
                return;
            }
        };

        match &self.mode {
            Mode::Undecided if msg.msg_type.opens_transfer_channel() => {
                let Some(opened) = self.handler.open_transfer(&self.sender, &msg).await else {
                    self.sender.close().await;
                    self.mode = Mode::Closing;
                    return;
                };
                info!(peer = %self.peer, transfer_id = %opened.transfer_id, "transfer channel opened");
                self.mode = Mode::Transfer {
                    transfer_id: opened.transfer_id,
                    inbound: opened.inbound,
                };
            }
            Mode::Undecided | Mode::Control => {
                if matches!(self.mode, Mode::Undecided) {
                    debug!(peer = %self.peer, "control channel opened");
                    self.mode = Mode::Control;
                }
                self.handler.dispatch_control(&self.sender, msg).await;
            }
            Mode::Transfer { inbound, .. } => match msg.msg_type {
                MessageType::EndOfStream => {
                    self.forward(inbound, Inbound::EndOfStream).await;
                }
                MessageType::Ping => {
                    if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                        let _ = self.sender.send_msg(reply);
                    }
                }
                other => {
                    let item = Inbound::Malformed(format!("unexpected {other:?} on transfer channel"));
                    self.forward(inbound, item).await;
                }
            },
            Mode::Closing => {}
        }
    }

    async fn on_binary(&self, data: Vec<u8>) {
        if data.len() > WS_MAX_MESSAGE_SIZE {
            error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
            return;
        }
        match &self.mode {
            Mode::Transfer { inbound, .. } => self.forward(inbound, Inbound::Chunk(data)).await,
            _ => warn!(peer = %self.peer, bytes = data.len(), "binary frame outside a transfer channel, dropped"),
        }
    }

    /// Hands an item to the session, waiting while its queue is full.
    async fn forward(&self, inbound: &mpsc::Sender<Inbound>, item: Inbound) {
        tokio::select! {
            res = inbound.send(item) => {
                if res.is_err() {
                    debug!(peer = %self.peer, "session no longer reading");
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Tells a still-running session that its channel is gone.
    fn hang_up(&mut self, reason: &str) {
        if let Mode::Transfer { transfer_id, inbound } = std::mem::replace(&mut self.mode, Mode::Control) {
            if inbound.try_send(Inbound::Closed(reason.to_string())).is_err() {
                // A full or closed queue still ends the session once the
                // sender below is dropped.
                debug!(transfer_id = %transfer_id, "could not queue channel-closed notice");
            }
        }
    }
}
