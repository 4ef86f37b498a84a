//! Session Layer
//!
//! Responsibilities:
//! - TLS encryption/decryption of the tunnel link
//!
//! This layer transforms the raw tunnel stream before framing is applied.
//! It does NOT parse the tunnel protocol or touch per-session state.

mod plain;
mod tls;

pub use plain::PlainSession;
pub use tls::{TlsConfig, TlsSession};

use async_trait::async_trait;

use crate::common::{Result, Stream};

/// Session trait for wrapping streams with encryption
///
/// Each session implementation wraps a stream and returns a new stream
/// with additional capabilities.
#[async_trait]
pub trait Session: Send + Sync {
    /// Wrap a stream (client-side: initiate handshake)
    async fn wrap_client(&self, stream: Stream) -> Result<Stream>;

    /// Wrap a stream (server-side: accept handshake)
    async fn wrap_server(&self, stream: Stream) -> Result<Stream>;
}
