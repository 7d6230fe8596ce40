//! Wire protocol shared by the uplink relay server and its clients.
//!
//! Two channel kinds share one WebSocket endpoint:
//! - a *transfer channel* carries one file: an `init_transfer` or
//!   `attach_transfer` envelope, binary chunk frames, then the
//!   `end_of_stream` sentinel; the server answers with [`TransferEvent`]s.
//! - a *control channel* carries request/response envelopes for
//!   out-of-band cancellation and batch management.

pub mod constants;
pub mod envelope;
pub mod events;
pub mod frame;
pub mod messages;
pub mod types;

pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use events::TransferEvent;
pub use frame::{ChunkFrame, ChunkHeader, FrameError, encode_chunk_frame, parse_chunk_frame};
pub use messages::FileDescriptor;
pub use types::{BatchState, CancelStatus, FileState, TransferState};
