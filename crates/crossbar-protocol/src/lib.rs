#![warn(missing_docs)]

//! Crossbar protocol subsystem: protocol graphs describing legal RPC message
//! transitions, plus the wire-facing message and frame views the proxy core
//! moves around.

pub mod error;
pub mod graph;
pub mod message;

pub use error::{ProtocolError, Result};
pub use graph::{GraphBuilder, GraphNode, InitiatingSlot, NodeRef, ProtocolGraph, SlotInfo};
pub use message::{Frame, Header, Headers, Message, REVOKE_EVENT_ID};
