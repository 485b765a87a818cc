//! The per-service proxy: graph, pool and the dispatch entry point.
//!
//! One [`Proxy`] stands in front of one named service. Callers hand it the
//! initiating message of an exchange together with their upstream handle; it
//! validates the message against the service's protocol graph, routes it
//! through the pool and returns the handles for the rest of the exchange.

use std::sync::Arc;

use tracing::debug;

use crossbar_protocol::{GraphNode, Message, ProtocolGraph};

use crate::access::AccessStats;
use crate::invocation::{Invocation, RouteDispatch};
use crate::pool::{Pool, PoolStats};
use crate::stream::{Direction, Stream};
use crate::transport::Upstream;
use crate::error::Result;

/// Live handles for one dispatched exchange.
pub struct DispatchedCall {
    /// Forward stream carrying the caller's follow-up payloads to the
    /// backend; accepts appends immediately, before any backend is chosen.
    pub forward: Arc<Stream>,
    /// Dispatch that routes the caller's follow-up messages through the
    /// protocol graph into the forward stream.
    pub client: Arc<RouteDispatch>,
}

/// Transparent proxy for one service.
pub struct Proxy {
    name: String,
    version: u64,
    protocol: Arc<ProtocolGraph>,
    root: GraphNode,
    pool: Arc<Pool>,
}

impl Proxy {
    /// Creates a proxy over an existing pool.
    pub fn new(
        name: impl Into<String>,
        version: u64,
        protocol: Arc<ProtocolGraph>,
        pool: Arc<Pool>,
    ) -> Self {
        let root = ProtocolGraph::root_of(Arc::clone(&protocol));
        Self { name: name.into(), version, protocol, root, pool }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service protocol version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The service's protocol graph.
    pub fn protocol(&self) -> &Arc<ProtocolGraph> {
        &self.protocol
    }

    /// The pool behind this proxy.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.pool.peer_count()
    }

    /// Whether no peers back this proxy. An empty proxy stays dispatchable;
    /// invocations queue until a peer registers.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Invocation counters.
    pub fn access_stats(&self) -> AccessStats {
        self.pool.access_stats()
    }

    /// Starts one exchange: validates the initiating message, wraps the
    /// caller's upstream in a backward stream and dispatches through the
    /// pool. Protocol errors surface synchronously; everything downstream of
    /// a valid initiation is reported through `upstream`.
    pub fn dispatch(
        &self,
        message: Message,
        upstream: Arc<dyn Upstream>,
    ) -> Result<DispatchedCall> {
        let backward = Arc::new(Stream::new(Direction::Backward));
        backward.attach_upstream(upstream)?;

        let invocation = Invocation::new(message, &self.root, backward, &self.name)?;
        let client = invocation.client_route();
        debug!(name = invocation.name(), "dispatching");
        let forward = self.pool.submit(invocation);
        Ok(DispatchedCall { forward, client })
    }
}

impl std::fmt::Debug for DispatchedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedCall").field("forward", &self.forward).finish()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("peers", &self.peer_count())
            .finish()
    }
}
