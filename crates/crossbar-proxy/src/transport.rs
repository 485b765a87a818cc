//! Transport-facing traits.
//!
//! The proxy core never opens sockets itself. It consumes a [`Connector`]
//! supplied at pool construction and talks to established connections through
//! [`RawConnection`]. Responses travel back to the original caller through an
//! [`Upstream`] handle owned by whatever server loop accepted the client.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use crossbar_protocol::{Frame, Headers};

use crate::error::Result;

/// Opens raw connections to peer endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to the first reachable endpoint of the given set.
    async fn connect(&self, endpoints: &[SocketAddr]) -> Result<Box<dyn RawConnection>>;
}

/// One established connection to a peer.
///
/// `send` must preserve submission order for frames of the same channel.
/// `detach` releases the underlying resources; the session wrapper guarantees
/// it is called exactly once.
pub trait RawConnection: Send + Sync {
    /// Writes one frame.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Releases the connection.
    fn detach(&self);
}

/// The original caller's handle, terminal target of every backward stream.
pub trait Upstream: Send + Sync {
    /// Delivers one response chunk.
    fn write(&self, headers: &Headers, chunk: Bytes) -> Result<()>;

    /// Delivers a terminal error.
    fn error(&self, headers: &Headers, code: u32, reason: &str) -> Result<()>;

    /// Closes the response side cleanly.
    fn close(&self, headers: &Headers) -> Result<()>;
}
