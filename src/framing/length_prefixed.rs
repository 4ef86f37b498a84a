//! Length-prefixed framing
//!
//! Each frame is a 4-byte little-endian payload length followed by the
//! payload bytes, carried over any [`Stream`] (plain TCP or TLS).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::common::{Error, Result, Stream};

use super::{FrameReader, FrameWriter, MAX_FRAME_LEN};

/// Length-prefixed framer over a byte stream
pub struct LengthPrefixedFramer;

impl LengthPrefixedFramer {
    /// Split a stream into the two framer halves.
    pub fn split(stream: Stream) -> (LengthPrefixedReader, LengthPrefixedWriter) {
        let (read, write) = tokio::io::split(stream);
        (
            LengthPrefixedReader { inner: read },
            LengthPrefixedWriter {
                inner: write,
                closed: false,
            },
        )
    }
}

/// Read half: length prefix, then payload
pub struct LengthPrefixedReader {
    inner: ReadHalf<Stream>,
}

/// Write half: length prefix, then payload
pub struct LengthPrefixedWriter {
    inner: WriteHalf<Stream>,
    closed: bool,
}

#[async_trait]
impl FrameReader for LengthPrefixedReader {
    async fn read(&mut self) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut len_buf).await {
            // EOF on the frame boundary is an orderly close; anything else
            // (including EOF inside the prefix) is a transport failure.
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(Error::TunnelClosed);
            }
            return Err(e.into());
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "frame length {} exceeds limit {}",
                len, MAX_FRAME_LEN
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Protocol("truncated frame".into())
            } else {
                Error::Io(e)
            }
        })?;

        Ok(payload.into())
    }
}

#[async_trait]
impl FrameWriter for LengthPrefixedWriter {
    async fn write(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "frame length {} exceeds limit {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        let len = (payload.len() as u32).to_le_bytes();
        self.inner.write_all(&len).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let (_reader_a, mut writer_a) = LengthPrefixedFramer::split(a.into_stream());
        let (mut reader_b, _writer_b) = LengthPrefixedFramer::split(b.into_stream());

        writer_a.write(Bytes::from_static(b"hello")).await.unwrap();
        writer_a.write(Bytes::new()).await.unwrap();
        writer_a.write(Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(reader_b.read().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(reader_b.read().await.unwrap(), Bytes::new());
        assert_eq!(reader_b.read().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn orderly_close_reads_as_tunnel_closed() {
        let (a, b) = tokio::io::duplex(64);
        let (mut reader, _writer) = LengthPrefixedFramer::split(a.into_stream());
        drop(b);

        assert!(matches!(reader.read().await, Err(Error::TunnelClosed)));
    }

    #[tokio::test]
    async fn oversize_length_is_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let (mut reader, _writer) = LengthPrefixedFramer::split(a.into_stream());

        let len = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        b.write_all(&len).await.unwrap();

        assert!(matches!(reader.read().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn truncated_payload_is_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let (mut reader, _writer) = LengthPrefixedFramer::split(a.into_stream());

        b.write_all(&8u32.to_le_bytes()).await.unwrap();
        b.write_all(b"abc").await.unwrap();
        drop(b);

        assert!(matches!(reader.read().await, Err(Error::Protocol(_))));
    }
}
