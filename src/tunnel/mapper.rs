//! Session registry
//!
//! The mapper is the only owner of session state on a tunnel side. It runs
//! as one task, selecting between frames arriving from the peer, closure
//! events from its own pumps and connectors, and new CONNECT sockets from
//! the proxy listener; everything it spawns talks back to it purely through
//! channels, so no session state is ever shared or locked.
//!
//! Sessions the two sides originate are tracked in separate registries keyed
//! by the originator's id counter. An inbound frame stamped `Local` refers to
//! a session the *peer* originated and is routed to the remote registry;
//! `Remote` the other way around. The same numeric id can therefore be live
//! in both registries at once without conflict.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::metrics::{FRAMES_DROPPED, SESSIONS_ACTIVE, SESSIONS_OPENED};
use crate::common::{Address, Stream};
use crate::proxy::RESPONSE_429_TOO_MANY;
use crate::transport::Transport;

use super::frame::{Frame, FrameKind, Origin};
use super::{connector, pump};

/// Frames buffered per session before the session is considered backed up
/// and closed. The mapper must never block on a slow session.
const SESSION_QUEUE_CAPACITY: usize = 64;

/// Probes the id allocator makes before giving up.
const MAX_ID_PROBES: u64 = 1 << 31;

/// A new locally originated session: an ingested CONNECT socket plus its
/// target address.
pub(crate) struct SessionRequest {
    pub stream: Stream,
    pub target: Address,
}

/// What the mapper holds per live session.
struct SessionEntry {
    /// In-order queue consumed by the session's writer pump.
    frames: mpsc::Sender<Frame>,
    /// Read half parked until the peer confirms the session
    /// (locally originated sessions only).
    parked_read: Option<ReadHalf<Stream>>,
    /// Cancelled by the writer pump when the socket is done.
    closed: CancellationToken,
}

pub(crate) struct Mapper {
    transport: Arc<dyn Transport>,
    tunnel_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<Frame>,
    /// Sessions this side originated, keyed by our own counter.
    local: HashMap<u32, SessionEntry>,
    /// Sessions the peer originated, keyed by the peer's counter.
    remote: HashMap<u32, SessionEntry>,
    next_id: u32,
    max_sessions: Option<usize>,
}

impl Mapper {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        tunnel_tx: mpsc::Sender<Frame>,
        events_tx: mpsc::Sender<Frame>,
        max_sessions: Option<usize>,
    ) -> Self {
        Self {
            transport,
            tunnel_tx,
            events_tx,
            local: HashMap::new(),
            remote: HashMap::new(),
            next_id: 0,
            max_sessions,
        }
    }

    /// Run until the inbound frame channel closes, then tear down.
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Frame>,
        mut events: mpsc::Receiver<Frame>,
        mut requests: mpsc::Receiver<SessionRequest>,
    ) {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame).await,
                    None => break,
                },
                Some(event) = events.recv() => self.session_event(event).await,
                Some(request) = requests.recv() => self.initiate(request).await,
            }
        }
        self.teardown();
    }

    /// Handle one frame from the peer.
    async fn dispatch(&mut self, frame: Frame) {
        let kind = match frame.frame_kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("mapper: {}", e);
                return;
            }
        };

        match kind {
            FrameKind::Connect => self.open_remote(frame).await,
            FrameKind::Connected => self.confirm_local(frame),
            FrameKind::Unavailable => self.reject_local(frame),
            FrameKind::Data => self.route_data(frame),
            FrameKind::Disconnected => self.route_disconnect(frame),
        }
    }

    /// Handle a closure event from one of our own pumps or connectors.
    ///
    /// Unlike wire frames, these name sessions from this side's own point of
    /// view. The session is forgotten here first, then the frame crosses the
    /// tunnel; by the time the peer's echo returns the registry slot is
    /// empty and the echo is dropped.
    async fn session_event(&mut self, frame: Frame) {
        match frame.frame_kind() {
            Ok(FrameKind::Disconnected) => {
                let Ok(origin) = frame.session_origin() else {
                    return;
                };
                let entry = match origin {
                    Origin::Local => self.remove_local(frame.id),
                    Origin::Remote => self.remove_remote(frame.id),
                };
                if let Some(entry) = entry {
                    let _ = entry.frames.try_send(frame.clone());
                }
                let _ = self.tunnel_tx.send(frame).await;
            }
            Ok(FrameKind::Unavailable) => {
                // Dial failure: the session never had pumps to unwind.
                self.remove_remote(frame.id);
                let _ = self.tunnel_tx.send(frame).await;
            }
            _ => {
                warn!("mapper: unexpected session event kind {}", frame.kind);
            }
        }
    }

    /// The peer wants a session: dial its target from here.
    async fn open_remote(&mut self, frame: Frame) {
        let id = frame.id;
        let target = match Address::parse_host_port(&frame.address) {
            Ok(target) => target,
            Err(e) => {
                warn!("mapper: bad connect target for session {}: {}", id, e);
                let _ = self.tunnel_tx.send(Frame::unavailable(id)).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        let entry = SessionEntry {
            frames: tx,
            parked_read: None,
            closed: closed.clone(),
        };
        if self.remote.insert(id, entry).is_some() {
            warn!("mapper: peer reused live session id {}", id);
        } else {
            SESSIONS_ACTIVE.with_label_values(&["remote"]).inc();
        }
        SESSIONS_OPENED.with_label_values(&["remote"]).inc();

        tokio::spawn(connector::run(
            self.transport.clone(),
            target,
            id,
            self.tunnel_tx.clone(),
            self.events_tx.clone(),
            rx,
            closed,
        ));
    }

    /// The peer's dial succeeded: start reading the client socket.
    ///
    /// The reader is spawned only now, so no client bytes were consumed
    /// while the far end was not yet ready for them.
    fn confirm_local(&mut self, frame: Frame) {
        let id = frame.id;
        let forwarded = match self.local.get_mut(&id) {
            Some(entry) => {
                if let Some(read) = entry.parked_read.take() {
                    tokio::spawn(pump::session_reader(
                        read,
                        self.tunnel_tx.clone(),
                        self.events_tx.clone(),
                        id,
                        Origin::Local,
                        entry.closed.clone(),
                    ));
                }
                forward(entry, frame)
            }
            None => {
                self.drop_frame(FrameKind::Connected, id);
                return;
            }
        };
        if !forwarded {
            self.remove_local(id);
        }
    }

    /// The peer's dial failed: pass the bad news and forget the session.
    fn reject_local(&mut self, frame: Frame) {
        let id = frame.id;
        match self.remove_local(id) {
            Some(entry) => {
                let _ = entry.frames.try_send(frame);
            }
            None => self.drop_frame(FrameKind::Unavailable, id),
        }
    }

    fn route_data(&mut self, frame: Frame) {
        let Ok(origin) = frame.session_origin() else {
            return;
        };
        let id = frame.id;
        match origin {
            // Stamped with the sender's local origin: the session lives in
            // our remote registry, and symmetrically below.
            Origin::Local => {
                let forwarded = match self.remote.get(&id) {
                    Some(entry) => forward(entry, frame),
                    None => {
                        self.drop_frame(FrameKind::Data, id);
                        return;
                    }
                };
                if !forwarded {
                    self.remove_remote(id);
                }
            }
            Origin::Remote => {
                let forwarded = match self.local.get(&id) {
                    Some(entry) => forward(entry, frame),
                    None => {
                        self.drop_frame(FrameKind::Data, id);
                        return;
                    }
                };
                if !forwarded {
                    self.remove_local(id);
                }
            }
        }
    }

    /// Final frame for a session: forward it and forget the session. The
    /// writer pump drains what is queued, closes the socket and releases
    /// the reader.
    fn route_disconnect(&mut self, frame: Frame) {
        let Ok(origin) = frame.session_origin() else {
            return;
        };
        let id = frame.id;
        let entry = match origin {
            Origin::Local => self.remove_remote(id),
            Origin::Remote => self.remove_local(id),
        };
        match entry {
            Some(entry) => {
                let _ = entry.frames.try_send(frame);
            }
            None => self.drop_frame(FrameKind::Disconnected, id),
        }
    }

    /// A CONNECT was accepted here: register the session and announce it.
    async fn initiate(&mut self, request: SessionRequest) {
        let at_capacity = self
            .max_sessions
            .map_or(false, |max| self.local.len() >= max);
        let id = if at_capacity {
            None
        } else {
            allocate_id(&mut self.next_id, &self.local)
        };
        let Some(id) = id else {
            warn!(
                "mapper: out of session ids, rejecting CONNECT to {}",
                request.target
            );
            let mut stream = request.stream;
            let _ = stream.write_all(RESPONSE_429_TOO_MANY).await;
            let _ = stream.shutdown().await;
            return;
        };

        debug!("mapper: session {} opening to {}", id, request.target);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        let (read, write) = tokio::io::split(request.stream);
        tokio::spawn(pump::session_writer(write, rx, closed.clone()));
        self.local.insert(
            id,
            SessionEntry {
                frames: tx,
                parked_read: Some(read),
                closed,
            },
        );
        SESSIONS_OPENED.with_label_values(&["local"]).inc();
        SESSIONS_ACTIVE.with_label_values(&["local"]).inc();

        if self
            .tunnel_tx
            .send(Frame::connect(id, &request.target))
            .await
            .is_err()
        {
            // Tunnel already gone; withdraw the session so its socket
            // closes now rather than at teardown.
            self.remove_local(id);
        }
    }

    fn remove_local(&mut self, id: u32) -> Option<SessionEntry> {
        let entry = self.local.remove(&id);
        if entry.is_some() {
            SESSIONS_ACTIVE.with_label_values(&["local"]).dec();
        }
        entry
    }

    fn remove_remote(&mut self, id: u32) -> Option<SessionEntry> {
        let entry = self.remote.remove(&id);
        if entry.is_some() {
            SESSIONS_ACTIVE.with_label_values(&["remote"]).dec();
        }
        entry
    }

    fn drop_frame(&self, kind: FrameKind, id: u32) {
        // Reachable during a close race: the session was just removed here
        // while the peer still had frames for it in flight.
        debug!("mapper: dropping {:?} for unknown session {}", kind, id);
        FRAMES_DROPPED.inc();
    }

    /// Drop every session. Closing the queues winds the writer pumps down,
    /// which close the sockets and release the readers.
    fn teardown(&mut self) {
        let open = self.local.len() + self.remote.len();
        if open > 0 {
            info!("mapper: tunnel closed, dropping {} open sessions", open);
        }
        SESSIONS_ACTIVE
            .with_label_values(&["local"])
            .sub(self.local.len() as i64);
        SESSIONS_ACTIVE
            .with_label_values(&["remote"])
            .sub(self.remote.len() as i64);
        self.local.clear();
        self.remote.clear();
    }
}

/// Enqueue a frame on a session without blocking.
///
/// Returns false when the session should be removed: either its queue is
/// backed up past the cap or its pumps are already gone.
fn forward(entry: &SessionEntry, frame: Frame) -> bool {
    match entry.frames.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            warn!("mapper: session {} backlog full, closing", frame.id);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Advance the counter to the next free id, wrapping and skipping occupied
/// slots, bounded so a full table fails instead of spinning forever.
fn allocate_id<V>(next: &mut u32, occupied: &HashMap<u32, V>) -> Option<u32> {
    for _ in 0..MAX_ID_PROBES {
        let candidate = *next;
        *next = next.wrapping_add(1);
        if !occupied.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential() {
        let occupied: HashMap<u32, ()> = HashMap::new();
        let mut next = 0;
        assert_eq!(allocate_id(&mut next, &occupied), Some(0));
        assert_eq!(allocate_id(&mut next, &occupied), Some(1));
        assert_eq!(allocate_id(&mut next, &occupied), Some(2));
    }

    #[test]
    fn allocation_wraps_and_skips_occupied() {
        let mut occupied: HashMap<u32, ()> = HashMap::new();
        occupied.insert(u32::MAX, ());
        occupied.insert(0, ());

        let mut next = u32::MAX;
        assert_eq!(allocate_id(&mut next, &occupied), Some(1));
        assert_eq!(next, 2);
    }

    #[test]
    fn freed_ids_are_reusable() {
        let mut occupied: HashMap<u32, ()> = HashMap::new();
        let mut next = 0;
        let id = allocate_id(&mut next, &occupied).unwrap();
        occupied.insert(id, ());
        occupied.remove(&id);
        // The counter has moved on, but a lap later the slot is free again.
        next = id;
        assert_eq!(allocate_id(&mut next, &occupied), Some(id));
    }
}
