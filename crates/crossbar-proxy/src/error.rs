//! Error taxonomy and wire-visible error codes.

use thiserror::Error;
use uuid::Uuid;

pub use crossbar_protocol::ProtocolError;

/// Error codes delivered through backward-stream discards and channel
/// revocations. The codec maps them onto the wire representation.
pub mod codes {
    /// Protocol mismatch: unknown slot or non-initiating slot.
    pub const PROTOCOL: u32 = 1;
    /// No peer could serve the invocation within the retry ceiling.
    pub const SERVICE_UNAVAILABLE: u32 = 2;
    /// The exchange was cancelled by the caller.
    pub const CANCELLED: u32 = 3;
    /// The session carrying the exchange was lost.
    pub const SESSION_LOST: u32 = 4;
}

/// Errors produced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Protocol graph lookup failed; fatal for the invocation, never retried.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer has no attached session.
    #[error("peer {uuid} is not connected")]
    NotConnected {
        /// Peer identity.
        uuid: Uuid,
    },

    /// The remote end dropped the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A connection attempt failed for every endpoint.
    #[error("could not connect to any of {endpoints} endpoints: {reason}")]
    ConnectFailed {
        /// Number of endpoints that were tried.
        endpoints: usize,
        /// Last underlying failure.
        reason: String,
    },

    /// The stream carries a terminal discard code; no further appends.
    #[error("stream already discarded with code {code}")]
    StreamDiscarded {
        /// The terminal code set by the first discard.
        code: u32,
    },

    /// The stream was closed cleanly; no further appends.
    #[error("stream already closed")]
    StreamClosed,

    /// A flush was attempted on a stream with no target.
    #[error("stream has no attached target")]
    StreamNotAttached,

    /// An inbound frame referenced a channel nobody owns.
    #[error("no route registered for channel {channel_id}")]
    UnknownChannel {
        /// The orphaned channel id.
        channel_id: u64,
    },

    /// A message arrived for an exchange that already ended.
    #[error("exchange {name} has already finished")]
    ExchangeFinished {
        /// Dispatch name of the finished exchange.
        name: String,
    },

    /// The invocation exhausted its retry budget.
    #[error("invocation exhausted {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// No balancer is registered under the requested name.
    #[error("unknown balancer strategy {name:?}")]
    UnknownBalancer {
        /// The requested strategy name.
        name: String,
    },

    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ProxyError>;
