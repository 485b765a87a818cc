//! Gateway layer: the service table fed by membership events and the
//! observation surface built over it.
//!
//! A caller resolves a service name, gets its protocol, and dispatches
//! through the service's [`crossbar_proxy::Proxy`]. Nodes announce and
//! retract themselves via [`GatewayTable::consume`] and
//! [`GatewayTable::cleanup`]; the table keeps one proxy per service name for
//! the union of all announcing nodes.

#![warn(missing_docs)]

pub mod error;
pub mod surface;
pub mod table;

pub use error::{GatewayError, Result};
pub use table::{GatewayConfig, GatewayTable, ServiceDescription};
