//! Framing Layer
//!
//! Responsibilities:
//! - Carry whole message payloads over an underlying byte transport
//! - NO protocol parsing, NO session bookkeeping
//!
//! The tunnel core never sees partial frames: one `read` returns exactly one
//! payload, one `write` emits exactly one. Two framings are provided:
//! a 4-byte little-endian length prefix over any [`Stream`], and binary
//! WebSocket messages (where the WebSocket frame is the boundary).
//!
//! Reading and writing happen on different tasks, so a framer is handed out
//! as two independently owned halves rather than one shared object.

pub mod length_prefixed;
pub mod websocket;

pub use length_prefixed::LengthPrefixedFramer;
pub use websocket::WebSocketFramer;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::Result;

/// Largest frame payload either side will accept.
///
/// Data frames carry at most a few KiB; anything approaching this limit is a
/// corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read half of a framed transport
#[async_trait]
pub trait FrameReader: Send {
    /// Read exactly one frame payload.
    ///
    /// Returns [`Error::TunnelClosed`](crate::error::Error::TunnelClosed)
    /// on orderly remote close.
    async fn read(&mut self) -> Result<Bytes>;
}

/// Write half of a framed transport
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one frame payload.
    async fn write(&mut self, payload: Bytes) -> Result<()>;

    /// Close the underlying transport. Idempotent.
    async fn close(&mut self);
}
