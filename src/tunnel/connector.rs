//! Session connector
//!
//! Runs on the side servicing a peer-originated session: dials the CONNECT
//! target and either brings the session's pumps up or reports the target
//! unavailable.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::metrics::DIAL_FAILURES;
use crate::common::Address;
use crate::transport::Transport;

use super::frame::{Frame, Origin};
use super::pump;

/// Dial `target` for peer session `id` and wire up its pumps.
///
/// The connected acknowledgment is sent only after the reader pump is
/// running, so data the peer sends immediately afterwards has a consumer.
/// A failed dial is reported to the mapper, which forgets the session and
/// passes the bad news to the peer.
pub(crate) async fn run(
    transport: Arc<dyn Transport>,
    target: Address,
    id: u32,
    tunnel_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<Frame>,
    frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    debug!("connector: dialing {} for session {}", target, id);
    let stream = match transport.connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("connector: dial {} failed for session {}: {}", target, id, e);
            DIAL_FAILURES.inc();
            let _ = events_tx.send(Frame::unavailable(id)).await;
            return;
        }
    };
    info!("connector: session {} connected to {}", id, target);

    let (read, write) = tokio::io::split(stream);
    tokio::spawn(pump::session_writer(write, frames, closed.clone()));
    tokio::spawn(pump::session_reader(
        read,
        tunnel_tx.clone(),
        events_tx,
        id,
        Origin::Remote,
        closed,
    ));

    let _ = tunnel_tx.send(Frame::connected(id)).await;
}
