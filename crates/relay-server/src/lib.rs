//! WebSocket front end for the uplink relay.
//!
//! Accepts any number of concurrent connections. The first message on a
//! connection decides what it is: `init_transfer` or `attach_transfer`
//! turns it into a transfer channel that carries exactly one file, anything
//! else makes it a control channel for cancellation and batch requests.
//! All transfer semantics live in [`uplink_transfer::Relay`]; this crate
//! only moves frames in and events out.

mod connection;
mod handler;
mod server;

pub use connection::{SendError, Sender};
pub use handler::RelayHandler;
pub use server::{RelayServer, ServerConfig};

/// Outbound queue capacity per connection.
///
/// Control replies use `try_send` and are dropped when the queue is full;
/// transfer events wait for room instead.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server already running")]
    AlreadyRunning,
}
