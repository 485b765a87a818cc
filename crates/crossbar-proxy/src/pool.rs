//! Peer pool: registration, dispatch, retry and rebalancing.
//!
//! The pool owns every known peer of one service. `invoke` never blocks: a
//! connected, unfrozen peer gets the invocation immediately; otherwise the
//! invocation is buffered (on the least-loaded peer's queue, or pool-wide
//! when no peers exist yet) and replayed once a session comes up. A
//! background task rebalances on a fixed period and whenever peer state
//! changes: expired freezes are lifted, stale idle sessions are recycled and
//! connects are started toward the configured pool size.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crossbar_protocol::{GraphNode, Message};

use crate::access::{AccessLog, AccessSpan, AccessStats, Outcome};
use crate::balancer::Balancer;
use crate::error::{codes, Result};
use crate::invocation::Invocation;
use crate::peer::{Peer, PeerState};
use crate::queue::PendingInvocation;
use crate::stream::Stream;
use crate::transport::Connector;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept open toward the service. Default: 3.
    pub pool_size: usize,
    /// Execution retries after the first failed attempt. Default: 3.
    pub retry_count: u32,
    /// How long a failed peer is excluded from selection. Default: 1s.
    pub freeze_time: Duration,
    /// Rebalance period; idle sessions older than this are recycled.
    /// Default: 15s.
    pub reconnect_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            retry_count: 3,
            freeze_time: Duration::from_secs(1),
            reconnect_age: Duration::from_secs(15),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Registered peers.
    pub peers: usize,
    /// Peers with a live session.
    pub connected: usize,
    /// Peers inside a freeze window.
    pub frozen: usize,
    /// Live connections, counted by session construction/teardown.
    pub live_connections: usize,
    /// Buffered invocations across all queues.
    pub queued: usize,
}

/// One peer's state for the observation surface.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    /// Node identity.
    pub uuid: Uuid,
    /// Advertised endpoints.
    pub endpoints: Vec<SocketAddr>,
    /// Whether the peer lives on this node.
    pub local: bool,
    /// Whether a session is attached.
    pub connected: bool,
    /// Whether a freeze window is open.
    pub frozen: bool,
    /// Buffered invocations on this peer's queue.
    pub queued: usize,
    /// Seconds since the last observed activity.
    pub idle_secs: f64,
}

struct PoolState {
    peers: HashMap<Uuid, Arc<Peer>>,
    next_seq: u64,
    fallback: VecDeque<PendingInvocation>,
}

/// All peers of one service plus the dispatch machinery over them.
pub struct Pool {
    service: String,
    config: PoolConfig,
    balancer: Arc<dyn Balancer>,
    connector: Arc<dyn Connector>,
    live_gauge: Arc<AtomicUsize>,
    access: Arc<AccessLog>,
    state: Mutex<PoolState>,
    wakeup: Arc<Notify>,
}

impl Pool {
    /// Creates a pool and spawns its rebalance task. Must run inside a tokio
    /// runtime.
    pub fn new(
        service: impl Into<String>,
        config: PoolConfig,
        balancer: Arc<dyn Balancer>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            service: service.into(),
            config,
            balancer,
            connector,
            live_gauge: Arc::new(AtomicUsize::new(0)),
            access: Arc::new(AccessLog::default()),
            state: Mutex::new(PoolState {
                peers: HashMap::new(),
                next_seq: 0,
                fallback: VecDeque::new(),
            }),
            wakeup: Arc::new(Notify::new()),
        });
        Self::spawn_rebalance_loop(&pool);
        pool
    }

    fn spawn_rebalance_loop(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let wakeup = Arc::clone(&pool.wakeup);
        let period = pool.config.reconnect_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wakeup.notified() => {}
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.rebalance();
            }
        });
    }

    /// Service name this pool serves; used as the dispatch root for
    /// invocation names.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peer_count() == 0
    }

    /// Looks up a registered peer.
    pub fn peer(&self, uuid: Uuid) -> Option<Arc<Peer>> {
        self.state.lock().unwrap().peers.get(&uuid).cloned()
    }

    /// Registers a peer or refreshes an existing one. A changed endpoint list
    /// tears the old session down; the peer reconnects on the next rebalance.
    pub fn register_real(
        &self,
        uuid: Uuid,
        endpoints: Vec<SocketAddr>,
        local: bool,
    ) -> Arc<Peer> {
        let peer = {
            let mut state = self.state.lock().unwrap();
            match state.peers.get(&uuid) {
                Some(existing) => {
                    let existing = Arc::clone(existing);
                    if existing.update_endpoints(endpoints) {
                        info!(service = %self.service, %uuid, "peer endpoints changed");
                        existing.disconnect();
                    }
                    existing
                }
                None => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let peer = Arc::new(Peer::new(uuid, endpoints, local, seq));
                    state.peers.insert(uuid, Arc::clone(&peer));
                    info!(service = %self.service, %uuid, seq, "registered peer");
                    peer
                }
            }
        };
        self.wakeup.notify_one();
        peer
    }

    /// Removes a peer. Its buffered invocations move to a surviving peer (or
    /// the pool-wide queue); in-flight exchanges keep their session alive
    /// through their own references and drain naturally.
    pub fn deregister_real(&self, uuid: Uuid) -> bool {
        let Some(peer) = self.state.lock().unwrap().peers.remove(&uuid) else {
            return false;
        };
        info!(service = %self.service, %uuid, "deregistered peer");

        let survivor = {
            let state = self.state.lock().unwrap();
            let now = Instant::now();
            let eligible: Vec<Arc<Peer>> =
                state.peers.values().filter(|p| p.eligible(now)).cloned().collect();
            self.balancer.choose_peer(&eligible).or_else(|| {
                state.peers.values().min_by_key(|p| (p.queue().len(), p.seq())).cloned()
            })
        };
        match survivor {
            Some(survivor) => {
                if let Err(err) = survivor.absorb(&peer) {
                    warn!(service = %self.service, %err, "absorb hit a failing session");
                }
            }
            None => {
                let orphaned = peer.queue().take_all();
                if !orphaned.is_empty() {
                    debug!(service = %self.service, count = orphaned.len(), "parking orphaned invocations");
                    self.state.lock().unwrap().fallback.extend(orphaned);
                }
            }
        }
        peer.disconnect();
        self.wakeup.notify_one();
        true
    }

    /// Validates and dispatches one invocation. Protocol errors surface here
    /// synchronously and buffer nothing; every other failure mode is reported
    /// through the backward stream. The returned forward stream accepts
    /// appends immediately.
    pub fn invoke(
        self: &Arc<Self>,
        message: Message,
        graph: &GraphNode,
        backward: Arc<Stream>,
    ) -> Result<Arc<Stream>> {
        let invocation = Invocation::new(message, graph, backward, &self.service)?;
        Ok(self.submit(invocation))
    }

    /// Dispatches an already-validated invocation.
    pub fn submit(self: &Arc<Self>, invocation: Invocation) -> Arc<Stream> {
        let pending = invocation.into_pending();
        let span = self.access.begin(&pending.name, pending.message.event_id);
        let forward = Arc::clone(&pending.forward);
        self.dispatch(pending, span);
        forward
    }

    fn dispatch(self: &Arc<Self>, mut pending: PendingInvocation, mut span: AccessSpan) {
        loop {
            if pending.attempts > self.config.retry_count {
                warn!(
                    service = %self.service,
                    name = %pending.name,
                    attempts = pending.attempts,
                    "retries exhausted"
                );
                if let Err(err) = pending
                    .backward
                    .discard(codes::SERVICE_UNAVAILABLE, "retries exhausted")
                {
                    warn!(service = %self.service, %err, "failed to deliver terminal error");
                }
                span.finish(Outcome::Failed);
                self.wakeup.notify_one();
                return;
            }

            let eligible = self.eligible_peers(Instant::now());
            let Some(peer) = self.balancer.choose_peer(&eligible) else {
                self.enqueue(pending);
                span.finish(Outcome::Queued);
                self.wakeup.notify_one();
                return;
            };
            let Some(session) = peer.session() else {
                // lost the session between selection and here
                peer.queue().push(pending);
                span.finish(Outcome::Queued);
                self.wakeup.notify_one();
                return;
            };

            span.attempt(peer.uuid());
            match pending.execute(&session) {
                Ok(()) => {
                    peer.touch();
                    span.finish(Outcome::Dispatched);
                    return;
                }
                Err(err) => {
                    warn!(service = %self.service, uuid = %peer.uuid(), %err, "execution failed");
                    peer.fail(self.config.freeze_time);
                    pending.attempts += 1;
                }
            }
        }
    }

    fn eligible_peers(&self, now: Instant) -> Vec<Arc<Peer>> {
        let state = self.state.lock().unwrap();
        state.peers.values().filter(|p| p.eligible(now)).cloned().collect()
    }

    /// Buffers an invocation when no peer is selectable: on the least-loaded
    /// (earliest-registered on ties) peer's queue, or pool-wide when no peers
    /// are registered at all.
    fn enqueue(&self, pending: PendingInvocation) {
        let mut state = self.state.lock().unwrap();
        let target = state.peers.values().min_by_key(|p| (p.queue().len(), p.seq())).cloned();
        match target {
            Some(peer) => {
                debug!(service = %self.service, uuid = %peer.uuid(), name = %pending.name, "queued invocation");
                peer.queue().push(pending);
            }
            None => {
                debug!(service = %self.service, name = %pending.name, "queued invocation pool-wide");
                state.fallback.push_back(pending);
            }
        }
    }

    /// One maintenance pass: lift expired freezes, recycle stale idle
    /// sessions, replay stragglers stuck on connected peers' queues, fail
    /// invocations that exhausted their retries while queued and start
    /// connects toward the pool size.
    pub fn rebalance(self: &Arc<Self>) {
        let now = Instant::now();
        let peers: Vec<Arc<Peer>> = {
            let state = self.state.lock().unwrap();
            state.peers.values().cloned().collect()
        };

        let mut connected = 0;
        for peer in &peers {
            peer.unfreeze_expired(now);
            peer.recycle_if_stale(self.config.reconnect_age);
            if peer.connected() {
                connected += 1;
                if !peer.queue().is_empty() {
                    if let Some(session) = peer.session() {
                        if let Err(err) = peer.queue().attach(session) {
                            warn!(service = %self.service, uuid = %peer.uuid(), %err, "queue replay failed");
                            peer.fail(self.config.freeze_time);
                            connected -= 1;
                        }
                    }
                }
            }
            for pending in peer.queue().take_exhausted(self.config.retry_count) {
                self.fail_exhausted(pending);
            }
        }

        let parked_exhausted: Vec<PendingInvocation> = {
            let mut state = self.state.lock().unwrap();
            let (exhausted, kept): (Vec<PendingInvocation>, Vec<PendingInvocation>) = state
                .fallback
                .drain(..)
                .partition(|p| p.attempts > self.config.retry_count);
            state.fallback = kept.into();
            exhausted
        };
        for pending in parked_exhausted {
            self.fail_exhausted(pending);
        }

        let mut candidates: Vec<Arc<Peer>> = peers
            .into_iter()
            .filter(|p| {
                matches!(p.state(), PeerState::Disconnected | PeerState::Failed)
                    && !p.frozen(now)
            })
            .collect();
        candidates.sort_by_key(|p| p.seq());
        for peer in candidates.into_iter().take(self.config.pool_size.saturating_sub(connected))
        {
            self.spawn_connect(peer);
        }
    }

    fn spawn_connect(self: &Arc<Self>, peer: Arc<Peer>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let connected = peer
                .connect(
                    pool.connector.as_ref(),
                    Arc::clone(&pool.live_gauge),
                    pool.config.freeze_time,
                )
                .await;
            match connected {
                Ok(_) => pool.drain_fallback(&peer),
                // the peer froze itself; the next tick retries
                Err(_) => {}
            }
        });
    }

    /// Replays pool-wide buffered invocations onto a freshly connected peer.
    /// Invocations already over the retry ceiling fail here instead of
    /// cycling back through the queues.
    fn drain_fallback(&self, peer: &Arc<Peer>) {
        let parked: Vec<PendingInvocation> = {
            let mut state = self.state.lock().unwrap();
            state.fallback.drain(..).collect()
        };
        for pending in parked {
            if pending.attempts > self.config.retry_count {
                self.fail_exhausted(pending);
            } else {
                peer.queue().append(pending);
            }
        }
        // a failed replay leaves work queued; let the next pass handle it
        if !peer.queue().is_empty() {
            self.wakeup.notify_one();
        }
    }

    /// Terminally fails an invocation whose retries ran out while it sat in
    /// a queue, outside the synchronous dispatch path.
    fn fail_exhausted(&self, pending: PendingInvocation) {
        warn!(
            service = %self.service,
            name = %pending.name,
            attempts = pending.attempts,
            "retries exhausted"
        );
        if let Err(err) =
            pending.backward.discard(codes::SERVICE_UNAVAILABLE, "retries exhausted")
        {
            warn!(service = %self.service, %err, "failed to deliver terminal error");
        }
        self.access.record_failure();
    }

    /// Current counters for the observation surface.
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        let mut connected = 0;
        let mut frozen = 0;
        let mut queued = state.fallback.len();
        for peer in state.peers.values() {
            if peer.connected() {
                connected += 1;
            }
            if peer.frozen(now) {
                frozen += 1;
            }
            queued += peer.queue().len();
        }
        PoolStats {
            peers: state.peers.len(),
            connected,
            frozen,
            live_connections: self.live_gauge.load(Ordering::SeqCst),
            queued,
        }
    }

    /// Invocation counters.
    pub fn access_stats(&self) -> AccessStats {
        self.access.stats()
    }

    /// Per-peer state for the observation surface.
    pub fn peers_summary(&self) -> Vec<PeerSummary> {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        let mut summaries: Vec<PeerSummary> = state
            .peers
            .values()
            .map(|peer| PeerSummary {
                uuid: peer.uuid(),
                endpoints: peer.endpoints(),
                local: peer.local(),
                connected: peer.connected(),
                frozen: peer.frozen(now),
                queued: peer.queue().len(),
                idle_secs: peer.last_active().elapsed().as_secs_f64(),
            })
            .collect();
        summaries.sort_by_key(|s| s.uuid);
        summaries
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("service", &self.service)
            .field("stats", &self.stats())
            .finish()
    }
}
