//! Per-session byte pumps
//!
//! Each open session runs two small tasks: a reader that turns socket bytes
//! into data frames, and a writer that replays inbound frames onto the
//! socket. The writer owns the socket's write half and is the only task that
//! shuts it down; the reader owns the read half. A shared cancellation token
//! carries the writer's "socket is done" signal to the reader.
//!
//! Data frames go straight to the tunnel writer; the reader's final
//! disconnect goes to the mapper instead, which forgets the session before
//! passing the frame on to the peer.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::app::metrics::{SESSION_BYTES_IN, SESSION_BYTES_OUT};
use crate::common::Stream;
use crate::proxy::{RESPONSE_200_OK, RESPONSE_503_UNAVAILABLE};

use super::frame::{Frame, FrameKind, Origin};

/// Socket read chunk size
const READ_BUFFER_SIZE: usize = 2048;

/// Pump socket bytes into data frames until the socket or the session dies.
///
/// Emits the session's single disconnect on the way out, whatever the
/// cause. If the tunnel is already gone both channels are dead and the
/// emits fall on the floor with it.
pub(crate) async fn session_reader(
    mut read: ReadHalf<Stream>,
    tunnel_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<Frame>,
    id: u32,
    origin: Origin,
    closed: CancellationToken,
) {
    trace!("session {} ({:?}) reader starts", id, origin);
    loop {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = tokio::select! {
            _ = closed.cancelled() => {
                debug!("session {} ({:?}) reader: closed by writer", id, origin);
                break;
            }
            result = read.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("session {} ({:?}) reader: peer closed", id, origin);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("session {} ({:?}) reader: read error: {}", id, origin, e);
                    break;
                }
            }
        };

        buf.truncate(n);
        SESSION_BYTES_IN.inc_by(n as u64);
        if tunnel_tx.send(Frame::data(id, origin, buf)).await.is_err() {
            break;
        }
    }

    let _ = events_tx.send(Frame::disconnected(id, origin)).await;
}

/// Replay a session's inbound frames onto its socket.
///
/// Consumes the session queue until it is closed or a terminal frame
/// arrives, then shuts the socket down and releases the reader.
pub(crate) async fn session_writer(
    mut write: WriteHalf<Stream>,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    while let Some(frame) = frames.recv().await {
        match frame.frame_kind() {
            Ok(FrameKind::Connected) => {
                if write.write_all(RESPONSE_200_OK).await.is_err() {
                    break;
                }
                let _ = write.flush().await;
                debug!("session {} writer: connected", frame.id);
            }
            Ok(FrameKind::Unavailable) => {
                let _ = write.write_all(RESPONSE_503_UNAVAILABLE).await;
                debug!("session {} writer: target unavailable", frame.id);
                break;
            }
            Ok(FrameKind::Disconnected) => {
                debug!("session {} writer: disconnected", frame.id);
                break;
            }
            Ok(FrameKind::Data) => {
                if write.write_all(&frame.data).await.is_err() {
                    break;
                }
                if write.flush().await.is_err() {
                    break;
                }
                SESSION_BYTES_OUT.inc_by(frame.data.len() as u64);
            }
            Ok(FrameKind::Connect) | Err(_) => {
                // The mapper never queues these here.
                warn!(
                    "session {} writer: unexpected frame kind {}",
                    frame.id, frame.kind
                );
            }
        }
    }

    let _ = write.shutdown().await;
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;

    fn split(stream: Stream) -> (ReadHalf<Stream>, WriteHalf<Stream>) {
        tokio::io::split(stream)
    }

    #[tokio::test]
    async fn writer_answers_connected_then_relays_data() {
        let (socket, mut client) = tokio::io::duplex(4096);
        let (_read, write) = split(socket.into_stream());
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();

        let writer = tokio::spawn(session_writer(write, rx, closed.clone()));

        tx.send(Frame::connected(1)).await.unwrap();
        tx.send(Frame::data(1, Origin::Local, b"payload".to_vec()))
            .await
            .unwrap();
        tx.send(Frame::disconnected(1, Origin::Local)).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\n\r\npayload");

        writer.await.unwrap();
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn writer_answers_unavailable_and_stops() {
        let (socket, mut client) = tokio::io::duplex(4096);
        let (_read, write) = split(socket.into_stream());
        let (tx, rx) = mpsc::channel(8);

        let writer = tokio::spawn(session_writer(write, rx, CancellationToken::new()));
        tx.send(Frame::unavailable(9)).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\n"
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn reader_frames_bytes_then_disconnects_on_eof() {
        let (socket, mut client) = tokio::io::duplex(4096);
        let (read, _write) = split(socket.into_stream());
        let (data_tx, mut data_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        tokio::spawn(session_reader(
            read,
            data_tx,
            events_tx,
            3,
            Origin::Remote,
            CancellationToken::new(),
        ));

        client.write_all(b"abc").await.unwrap();
        let frame = data_rx.recv().await.unwrap();
        assert_eq!(frame.frame_kind().unwrap(), FrameKind::Data);
        assert_eq!(frame.id, 3);
        assert_eq!(frame.session_origin().unwrap(), Origin::Remote);
        assert_eq!(frame.data, b"abc");

        drop(client);
        let frame = events_rx.recv().await.unwrap();
        assert_eq!(frame.frame_kind().unwrap(), FrameKind::Disconnected);
        assert_eq!(frame.session_origin().unwrap(), Origin::Remote);
        assert!(data_rx.recv().await.is_none());
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reader_disconnects_when_writer_closes() {
        let (socket, _client) = tokio::io::duplex(4096);
        let (read, _write) = split(socket.into_stream());
        let (data_tx, _data_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let closed = CancellationToken::new();

        tokio::spawn(session_reader(
            read,
            data_tx,
            events_tx,
            4,
            Origin::Local,
            closed.clone(),
        ));
        closed.cancel();

        let frame = events_rx.recv().await.unwrap();
        assert_eq!(frame.frame_kind().unwrap(), FrameKind::Disconnected);
        assert_eq!(frame.id, 4);
    }
}
