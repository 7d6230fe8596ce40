//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.
//!
//! ```text
//! [u32 BE: header_len][header_len bytes: {"transferId": "...", "seq": N}][payload]
//! ```
//!
//! `seq` starts at 0 and increases by one per chunk so the receiver can
//! detect gaps and duplicates.

use serde::{Deserialize, Serialize};

/// Header preceding each chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub transfer_id: String,
    pub seq: u64,
}

/// A parsed chunk frame borrowing its payload from the raw message.
#[derive(Debug)]
pub struct ChunkFrame<'a> {
    pub header: ChunkHeader,
    pub payload: &'a [u8],
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

/// Parses a raw binary WebSocket message into a [`ChunkFrame`].
pub fn parse_chunk_frame(data: &[u8]) -> Result<ChunkFrame<'_>, FrameError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(FrameError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: ChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

    Ok(ChunkFrame { header, payload })
}

/// Encodes a chunk frame for sending over WebSocket.
pub fn encode_chunk_frame(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}
