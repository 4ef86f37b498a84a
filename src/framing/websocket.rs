//! WebSocket framing
//!
//! Binary WebSocket messages carry the payloads; the WebSocket frame boundary
//! replaces the length prefix. Ping/pong traffic is absorbed at this layer.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use crate::common::{Error, Result};

use super::{FrameReader, FrameWriter, MAX_FRAME_LEN};

/// WebSocket framer over an established WebSocket stream
pub struct WebSocketFramer;

impl WebSocketFramer {
    /// Split a handshaken WebSocket stream into the two framer halves.
    pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketFrameReader<S>, WebSocketFrameWriter<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        (
            WebSocketFrameReader { inner: stream },
            WebSocketFrameWriter {
                inner: sink,
                closed: false,
            },
        )
    }
}

/// Read half: one binary message per frame
pub struct WebSocketFrameReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Write half: one binary message per frame
pub struct WebSocketFrameWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> FrameReader for WebSocketFrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self) -> Result<Bytes> {
        loop {
            let message = match self.inner.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                None => return Err(Error::TunnelClosed),
            };

            match message {
                Message::Binary(data) => {
                    if data.len() > MAX_FRAME_LEN {
                        return Err(Error::Protocol(format!(
                            "frame length {} exceeds limit {}",
                            data.len(),
                            MAX_FRAME_LEN
                        )));
                    }
                    return Ok(Bytes::from(data));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    trace!("websocket keepalive frame");
                }
                Message::Close(_) => return Err(Error::TunnelClosed),
                Message::Text(_) => {
                    return Err(Error::Protocol("unexpected text frame".into()));
                }
                Message::Frame(_) => {
                    return Err(Error::Protocol("unexpected raw frame".into()));
                }
            }
        }
    }
}

#[async_trait]
impl<S> FrameWriter for WebSocketFrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, payload: Bytes) -> Result<()> {
        self.inner
            .send(Message::Binary(payload.to_vec()))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.send(Message::Close(None)).await;
            let _ = self.inner.close().await;
        }
    }
}
