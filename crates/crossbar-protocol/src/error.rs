//! Protocol-level errors.

use thiserror::Error;

/// Errors produced by protocol graph construction and slot lookup.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The slot id is not present in the current protocol node.
    #[error("could not find slot {slot_id} in protocol for {dispatch}")]
    SlotNotFound {
        /// Slot id that was looked up.
        slot_id: u64,
        /// Dispatch name the lookup was performed for.
        dispatch: String,
    },

    /// A slot was used to initiate an exchange but lacks a continuation.
    #[error("slot {slot_id} ({name}) cannot initiate an exchange: {side} continuation is missing")]
    RecurrentInitiation {
        /// Slot id of the offending message.
        slot_id: u64,
        /// Slot name as defined in the graph.
        name: String,
        /// Which continuation was missing, `"forward"` or `"backward"`.
        side: &'static str,
    },

    /// A slot references a node that is not defined in the graph.
    #[error("slot table references node {node} but graph has {len} nodes")]
    InvalidNodeRef {
        /// The out-of-range node index.
        node: usize,
        /// Number of nodes actually defined.
        len: usize,
    },
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ProtocolError>;
