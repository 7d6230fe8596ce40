//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and
//! serves each one on its own task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uplink_protocol::constants::WS_MAX_MESSAGE_SIZE;
use uplink_transfer::Relay;

use crate::ServerError;
use crate::connection;
use crate::handler::RelayHandler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

/// The relay WebSocket server.
pub struct RelayServer {
    config: ServerConfig,
    handler: Arc<RelayHandler>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Arc<AtomicUsize>,
}

/// Decrements the live-connection count when a connection task ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Relay) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(RelayHandler::new(relay)),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn relay(&self) -> &Relay {
        self.handler.relay()
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`bind`](Self::bind).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let mut local = self.local_addr.lock().await;
        if local.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = TcpListener::bind(SocketAddr::new(self.config.bind, self.config.port)).await?;
        let addr = listener.local_addr()?;
        *local = Some(addr);
        info!("relay server listening on {addr}");
        Ok(listener)
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and serves it to completion.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        self.connections.fetch_add(1, Ordering::SeqCst);
        let _guard = ConnectionGuard(self.connections.clone());
        info!(%peer_addr, "WebSocket connection established");

        connection::serve_connection(
            ws_stream,
            peer_addr,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        )
        .await;
        Ok(())
    }
}
