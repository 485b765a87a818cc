//! Gateway error taxonomy.

use thiserror::Error;
use uuid::Uuid;

pub use crossbar_proxy::ProxyError;

/// Errors produced by the gateway layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No service is registered under the requested name. Synchronous and
    /// fatal for the request; nothing is queued.
    #[error("service {name:?} is not registered")]
    ServiceNotFound {
        /// The requested service name.
        name: String,
    },

    /// The peer is not registered with the addressed service.
    #[error("peer {uuid} is not registered")]
    UnknownPeer {
        /// The unknown peer identity.
        uuid: Uuid,
    },

    /// Failure bubbled up from the proxy core.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, GatewayError>;
