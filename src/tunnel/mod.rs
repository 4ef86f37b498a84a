//! Tunnel core
//!
//! One live tunnel binds a framed transport on each side and multiplexes any
//! number of proxied sessions over it:
//!
//! ```text
//! proxy socket → ingester → mapper → frame writer ─(wire)─ frame reader → mapper
//!                                                               ↓
//!                                                           connector → target
//! ```
//!
//! The mapper owns all session state; the transport loops here only move
//! frames between the framer and the mapper's channels. When the reader
//! ends — peer closed, transport error, or cancellation — the writer is
//! stopped before it can touch the dead transport, the mapper input closes,
//! and teardown drops every session.

mod connector;
mod frame;
mod mapper;
mod pump;

pub use frame::{Frame, FrameKind, Origin};
pub(crate) use mapper::SessionRequest;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::metrics::{TUNNEL_FRAMES_RECEIVED, TUNNEL_FRAMES_SENT};
use crate::common::{Error, Stream};
use crate::framing::{FrameReader, FrameWriter};
use crate::proxy::{self, Filter, DEFAULT_CONNECT_TIMEOUT};
use crate::transport::Transport;

use mapper::Mapper;

/// Frames in flight between the transport loops and the mapper
const TUNNEL_QUEUE_CAPACITY: usize = 128;

/// Ingested CONNECT sockets awaiting the mapper
const REQUEST_QUEUE_CAPACITY: usize = 16;

/// One side of a two-node tunnel.
///
/// Construction picks the collaborators; [`serve`](Tunnel::serve) binds a
/// live framed transport and runs until it dies.
pub struct Tunnel {
    transport: Arc<dyn Transport>,
    filter: Option<Arc<dyn Filter>>,
    connect_timeout: Duration,
    max_sessions: Option<usize>,
}

impl Tunnel {
    /// A tunnel side that dials CONNECT targets through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            filter: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_sessions: None,
        }
    }

    /// Gate inbound CONNECT requests through `filter`.
    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Deadline for reading a CONNECT header block.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Cap on concurrently open locally originated sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Serve one tunnel over an established framed transport.
    ///
    /// `sockets` feeds accepted proxy connections in; an idle side passes a
    /// channel whose sender side was dropped. Returns when the peer goes
    /// away, the transport fails, or `cancel` fires — by then every session
    /// is torn down and the transport is closed.
    pub async fn serve(
        &self,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        sockets: mpsc::Receiver<Stream>,
        cancel: CancellationToken,
    ) {
        let stop = cancel.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

        let ingester = tokio::spawn(proxy::ingest(
            sockets,
            request_tx,
            self.filter.clone(),
            self.connect_timeout,
            stop.clone(),
        ));

        let mapper = Mapper::new(
            self.transport.clone(),
            outbound_tx,
            events_tx,
            self.max_sessions,
        );
        let mapper_task = tokio::spawn(mapper.run(inbound_rx, events_rx, request_rx));
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, stop.clone()));

        // Blocks until the peer goes away, the transport fails, or we are
        // cancelled. Dropping `inbound_tx` afterwards is what tells the
        // mapper to tear down.
        read_loop(reader, inbound_tx, stop.clone()).await;

        stop.cancel();
        let _ = writer_task.await;
        let _ = mapper_task.await;
        let _ = ingester.await;
        info!("tunnel closed");
    }
}

/// Pump frames off the wire into the mapper.
async fn read_loop(
    mut reader: Box<dyn FrameReader>,
    inbound: mpsc::Sender<Frame>,
    stop: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = stop.cancelled() => {
                debug!("tunnel reader: cancelled");
                return;
            }
            result = reader.read() => match result {
                Ok(payload) => payload,
                Err(Error::TunnelClosed) => {
                    info!("tunnel reader: peer closed");
                    return;
                }
                Err(e) => {
                    warn!("tunnel reader: {}", e);
                    return;
                }
            }
        };

        let frame = match Frame::decode_payload(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("tunnel reader: {}", e);
                return;
            }
        };
        TUNNEL_FRAMES_RECEIVED.inc();

        if inbound.send(frame).await.is_err() {
            return;
        }
    }
}

/// Pump mapper output onto the wire. Owns the framer close.
async fn write_loop(
    mut writer: Box<dyn FrameWriter>,
    mut outbound: mpsc::Receiver<Frame>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            }
        };

        if let Err(e) = writer.write(frame.encode_payload()).await {
            warn!("tunnel writer: {}", e);
            break;
        }
        TUNNEL_FRAMES_SENT.inc();
    }
    writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, IntoStream, Result};
    use crate::framing::LengthPrefixedFramer;
    use crate::proxy::BasicAuthFilter;
    use async_trait::async_trait;
    use rand::RngCore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Dials an in-memory echo server.
    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn connect(&self, _addr: &Address) -> Result<Stream> {
            let (near, mut far) = tokio::io::duplex(256 * 1024);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match far.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if far.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(near.into_stream())
        }

        async fn bind(&self, _addr: &Address) -> Result<Box<dyn crate::transport::Listener>> {
            Err(Error::Config("test transport cannot bind".into()))
        }
    }

    /// Every dial is refused.
    struct RefusingTransport;

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn connect(&self, _addr: &Address) -> Result<Stream> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }

        async fn bind(&self, _addr: &Address) -> Result<Box<dyn crate::transport::Listener>> {
            Err(Error::Config("test transport cannot bind".into()))
        }
    }

    struct TestSide {
        sockets: mpsc::Sender<Stream>,
        cancel: CancellationToken,
        served: tokio::task::JoinHandle<()>,
    }

    fn spawn_side(tunnel: Tunnel, stream: Stream) -> TestSide {
        let (reader, writer) = LengthPrefixedFramer::split(stream);
        let (sockets_tx, sockets_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let served = tokio::spawn(async move {
            tunnel
                .serve(Box::new(reader), Box::new(writer), sockets_rx, serve_cancel)
                .await;
        });
        TestSide {
            sockets: sockets_tx,
            cancel,
            served,
        }
    }

    /// Two linked tunnel sides: proxy clients enter through A, targets are
    /// dialed from B.
    fn linked_pair(side_b_transport: Arc<dyn Transport>) -> (TestSide, TestSide) {
        let (wire_a, wire_b) = tokio::io::duplex(1024 * 1024);
        let side_a = spawn_side(Tunnel::new(Arc::new(EchoTransport)), wire_a.into_stream());
        let side_b = spawn_side(Tunnel::new(side_b_transport), wire_b.into_stream());
        (side_a, side_b)
    }

    /// Open a proxy client socket against `side` and run the CONNECT
    /// handshake for `target`.
    async fn connect_client(side: &TestSide, target: &str) -> DuplexStream {
        let (mut client, socket) = tokio::io::duplex(256 * 1024);
        side.sockets.send(socket.into_stream()).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();

        let mut status = vec![0u8; proxy::RESPONSE_200_OK.len()];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, proxy::RESPONSE_200_OK);
        client
    }

    #[tokio::test]
    async fn connect_and_echo() {
        let (side_a, _side_b) = linked_pair(Arc::new(EchoTransport));
        let mut client = connect_client(&side_a, "echo.test:9").await;

        client.write_all(b"hello").await.unwrap();
        let mut buf = vec![0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn unreachable_target_gets_503() {
        let (side_a, _side_b) = linked_pair(Arc::new(RefusingTransport));

        let (mut client, socket) = tokio::io::duplex(4096);
        side_a.sockets.send(socket.into_stream()).await.unwrap();
        client
            .write_all(b"CONNECT dead.test:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, proxy::RESPONSE_503_UNAVAILABLE);
    }

    #[tokio::test]
    async fn filtered_connect_gets_407_and_sends_nothing() {
        // Side A alone, with the raw wire held by the test so any frame it
        // emits would be observable.
        let (wire_a, wire_b) = tokio::io::duplex(4096);
        let tunnel = Tunnel::new(Arc::new(EchoTransport))
            .with_filter(Arc::new(BasicAuthFilter::new("admin", "hunter2")));
        let side_a = spawn_side(tunnel, wire_a.into_stream());
        let (mut peer_reader, _peer_writer) = LengthPrefixedFramer::split(wire_b.into_stream());

        let (mut client, socket) = tokio::io::duplex(4096);
        side_a.sockets.send(socket.into_stream()).await.unwrap();
        client
            .write_all(b"CONNECT secret.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, proxy::RESPONSE_407_AUTH_REQUIRED);

        // No tunnel frame may have crossed the wire.
        let silent =
            tokio::time::timeout(Duration::from_millis(100), peer_reader.read()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn concurrent_sessions_preserve_data_both_ways() {
        let (side_a, side_b) = linked_pair(Arc::new(EchoTransport));

        // Proxy clients on both sides at once: both mappers allocate their
        // own id 0, and the two same-numbered sessions must not interfere.
        let mut handles = Vec::new();
        for (side, target) in [(&side_a, "one.test:1"), (&side_b, "two.test:2")] {
            let mut client = connect_client(side, target).await;
            handles.push(tokio::spawn(async move {
                let mut payload = vec![0u8; 16 * 1024];
                rand::thread_rng().fill_bytes(&mut payload);

                client.write_all(&payload).await.unwrap();
                let mut echoed = vec![0u8; payload.len()];
                client.read_exact(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn session_close_settles_and_tunnel_stays_usable() {
        let (side_a, _side_b) = linked_pair(Arc::new(EchoTransport));

        let mut client = connect_client(&side_a, "echo.test:9").await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        drop(client);

        // The close dance races a disconnect back at us; a fresh session
        // must still open cleanly afterwards.
        let mut client = connect_client(&side_a, "echo.test:9").await;
        client.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
    }

    #[tokio::test]
    async fn tunnel_loss_tears_down_live_sessions() {
        let (side_a, side_b) = linked_pair(Arc::new(EchoTransport));
        let mut client = connect_client(&side_a, "echo.test:9").await;

        // Kill side B's transport out from under the session.
        side_b.cancel.cancel();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        side_b.served.await.unwrap();
        side_a.served.await.unwrap();

        // Repeated cancellation is a no-op.
        side_b.cancel.cancel();
        side_a.cancel.cancel();
    }

    #[tokio::test]
    async fn session_cap_answers_429() {
        let (wire_a, wire_b) = tokio::io::duplex(1024 * 1024);
        let tunnel = Tunnel::new(Arc::new(EchoTransport)).with_max_sessions(1);
        let side_a = spawn_side(tunnel, wire_a.into_stream());
        let _side_b = spawn_side(Tunnel::new(Arc::new(EchoTransport)), wire_b.into_stream());

        let first = connect_client(&side_a, "echo.test:9").await;

        let (mut second, socket) = tokio::io::duplex(4096);
        side_a.sockets.send(socket.into_stream()).await.unwrap();
        second
            .write_all(b"CONNECT echo.test:9 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        second.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, proxy::RESPONSE_429_TOO_MANY);
        drop(first);
    }
}
