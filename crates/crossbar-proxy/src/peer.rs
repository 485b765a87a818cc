//! Peer lifecycle and connection state.
//!
//! A [`Peer`] is one known backend node: its endpoints, its connection state
//! machine and the invocation queue holding work destined for it. The state
//! machine admits exactly the transitions a real connection can take:
//! `Disconnected -> Connecting`, `Connecting -> Connected | Failed`,
//! `Connected -> Disconnected | Failed`, `Failed -> Connecting` (once its
//! freeze window has passed).

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{codes, ProxyError, Result};
use crate::queue::InvocationQueue;
use crate::session::Session;
use crate::transport::Connector;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A live session is attached.
    Connected,
    /// The last attempt or session failed; frozen until further notice.
    Failed,
}

struct PeerCore {
    endpoints: Vec<SocketAddr>,
    state: PeerState,
    session: Option<Session>,
    last_active: Instant,
    frozen_until: Option<Instant>,
}

/// One known backend node.
pub struct Peer {
    uuid: Uuid,
    seq: u64,
    local: bool,
    core: Mutex<PeerCore>,
    queue: InvocationQueue,
}

impl Peer {
    /// Creates a disconnected peer. `seq` is the registration sequence number
    /// used for deterministic ordering among otherwise equal peers.
    pub fn new(uuid: Uuid, endpoints: Vec<SocketAddr>, local: bool, seq: u64) -> Self {
        Self {
            uuid,
            seq,
            local,
            core: Mutex::new(PeerCore {
                endpoints,
                state: PeerState::Disconnected,
                session: None,
                last_active: Instant::now(),
                frozen_until: None,
            }),
            queue: InvocationQueue::new(),
        }
    }

    /// Node identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Registration sequence number, stable for the peer's lifetime.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether the peer lives on this node.
    pub fn local(&self) -> bool {
        self.local
    }

    /// Current endpoint list.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.core.lock().unwrap().endpoints.clone()
    }

    /// Replaces the endpoint list; returns whether it actually changed.
    pub fn update_endpoints(&self, endpoints: Vec<SocketAddr>) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.endpoints == endpoints {
            return false;
        }
        core.endpoints = endpoints;
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.core.lock().unwrap().state
    }

    /// The live session, when connected.
    pub fn session(&self) -> Option<Session> {
        self.core.lock().unwrap().session.clone()
    }

    /// The queue of invocations buffered for this peer.
    pub fn queue(&self) -> &InvocationQueue {
        &self.queue
    }

    /// Whether a live session is attached.
    pub fn connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Time of the last observed activity.
    pub fn last_active(&self) -> Instant {
        self.core.lock().unwrap().last_active
    }

    /// Records activity now.
    pub fn touch(&self) {
        self.core.lock().unwrap().last_active = Instant::now();
    }

    /// Whether the freeze window is still open at `now`.
    pub fn frozen(&self, now: Instant) -> bool {
        match self.core.lock().unwrap().frozen_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// Opens a freeze window of `duration` starting now.
    pub fn freeze(&self, duration: Duration) {
        let mut core = self.core.lock().unwrap();
        core.frozen_until = Some(Instant::now() + duration);
        debug!(uuid = %self.uuid, ?duration, "froze peer");
    }

    /// Clears the freeze window if it has expired at `now`.
    pub fn unfreeze_expired(&self, now: Instant) {
        let mut core = self.core.lock().unwrap();
        if matches!(core.frozen_until, Some(until) if until <= now) {
            core.frozen_until = None;
        }
    }

    /// Whether this peer may receive new invocations at `now`: connected and
    /// outside any freeze window.
    pub fn eligible(&self, now: Instant) -> bool {
        let core = self.core.lock().unwrap();
        core.state == PeerState::Connected
            && !matches!(core.frozen_until, Some(until) if now < until)
    }

    /// Claims the connecting slot. Returns false when a connect is already in
    /// flight or a session is already attached, so at most one attempt runs.
    fn begin_connect(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        match core.state {
            PeerState::Disconnected | PeerState::Failed => {
                core.state = PeerState::Connecting;
                true
            }
            PeerState::Connecting | PeerState::Connected => false,
        }
    }

    /// Connects through `connector` and, on success, attaches the session and
    /// drains the queue. On any failure the peer is marked [`PeerState::Failed`]
    /// and frozen for `freeze_time`; buffered invocations stay queued.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        live_gauge: Arc<AtomicUsize>,
        freeze_time: Duration,
    ) -> Result<Session> {
        if !self.begin_connect() {
            if let Some(session) = self.session() {
                return Ok(session);
            }
            return Err(ProxyError::NotConnected { uuid: self.uuid });
        }

        let endpoints = self.endpoints();
        match connector.connect(&endpoints).await {
            Ok(conn) => {
                let session = Session::new(conn, live_gauge);
                {
                    let mut core = self.core.lock().unwrap();
                    core.state = PeerState::Connected;
                    core.session = Some(session.clone());
                    core.last_active = Instant::now();
                }
                info!(uuid = %self.uuid, "peer connected");
                if let Err(err) = self.queue.attach(session.clone()) {
                    warn!(uuid = %self.uuid, %err, "queue drain failed on fresh session");
                    self.fail(freeze_time);
                    return Err(err);
                }
                Ok(session)
            }
            Err(err) => {
                warn!(uuid = %self.uuid, %err, "peer connect failed");
                self.fail(freeze_time);
                Err(err)
            }
        }
    }

    /// Marks the peer failed and opens a freeze window. Any attached session
    /// is torn down with its open exchanges discarded; queued invocations are
    /// kept for the next session.
    pub fn fail(&self, freeze_time: Duration) {
        let session = {
            let mut core = self.core.lock().unwrap();
            core.state = PeerState::Failed;
            core.frozen_until = Some(Instant::now() + freeze_time);
            core.session.take()
        };
        self.queue.disconnect();
        if let Some(session) = session {
            session.discard_all(codes::SESSION_LOST, "peer failed");
        }
    }

    /// Graceful disconnect: drops this peer's session handle without
    /// discarding in-flight exchanges, which keep the session alive through
    /// their own references until they drain.
    pub fn disconnect(&self) {
        let session = {
            let mut core = self.core.lock().unwrap();
            core.state = PeerState::Disconnected;
            core.session.take()
        };
        self.queue.disconnect();
        drop(session);
        debug!(uuid = %self.uuid, "peer disconnected");
    }

    /// Drops a session older than `max_age` with no in-flight exchanges, so
    /// the next rebalance reconnects fresh. Returns whether it was recycled.
    pub fn recycle_if_stale(&self, max_age: Duration) -> bool {
        let mut core = self.core.lock().unwrap();
        let stale = matches!(&core.session, Some(s) if s.age() > max_age && s.idle());
        if stale {
            core.session = None;
            core.state = PeerState::Disconnected;
        }
        drop(core);
        if stale {
            self.queue.disconnect();
            info!(uuid = %self.uuid, "recycled stale session");
        }
        stale
    }

    /// Moves another peer's buffered invocations onto this peer's queue,
    /// preserving their relative order.
    pub fn absorb(&self, other: &Peer) -> Result<usize> {
        let moved = self.queue.absorb(other.queue())?;
        if moved > 0 {
            debug!(from = %other.uuid, to = %self.uuid, moved, "absorbed queued invocations");
        }
        Ok(moved)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}
