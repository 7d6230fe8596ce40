//! Socket plumbing shared by both client kinds.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::error;
use uplink_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ClientError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsRead = SplitStream<WsStream>;
type WsWrite = SplitSink<WsStream, tungstenite::Message>;

/// Outbound queue capacity.
const WRITE_QUEUE: usize = 64;

/// Connects and starts a write pump. Returns the queue feeding it and the
/// read half.
pub(crate) async fn connect(
    url: &str,
    cancel: &CancellationToken,
) -> Result<(mpsc::Sender<tungstenite::Message>, WsRead, tokio::task::JoinHandle<()>), ClientError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let (ws_stream, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
    let (write, read): (WsWrite, WsRead) = ws_stream.split();

    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
    let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
    Ok((write_tx, read, write_handle))
}

/// Writes queued messages to the socket, closing it on cancel.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
