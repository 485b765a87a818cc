//! Protocol-aware RPC proxying.
//!
//! This crate carries exchanges between callers and a pool of backend peers
//! without understanding payloads: it only walks the service's protocol graph
//! to know which messages may follow which. Exchanges started before a
//! backend is available are buffered and replayed in order; backend failures
//! are retried against other peers up to a configured ceiling, after which
//! the caller sees a single terminal error on its backward stream.

#![warn(missing_docs)]

pub mod access;
pub mod balancer;
pub mod error;
pub mod invocation;
pub mod peer;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use access::{AccessLog, AccessStats};
pub use balancer::{Balancer, BalancerRegistry, RandomBalancer, RoundRobinBalancer};
pub use error::{codes, ProxyError, Result};
pub use invocation::{Invocation, RouteDispatch, Transition};
pub use peer::{Peer, PeerState};
pub use pool::{PeerSummary, Pool, PoolConfig, PoolStats};
pub use proxy::{DispatchedCall, Proxy};
pub use queue::{InvocationQueue, PendingInvocation};
pub use session::{Channel, Session};
pub use stream::{Direction, Stream};
pub use transport::{Connector, RawConnection, Upstream};
