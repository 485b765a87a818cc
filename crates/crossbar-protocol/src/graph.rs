//! Protocol graphs.
//!
//! An RPC protocol is not a fixed request/response pair but a directed graph
//! of message slots: each slot names the messages that may legally follow it,
//! separately for the forward (toward the backend) and backward (toward the
//! caller) halves of an exchange. The graph is stored as an immutable table
//! of nodes referenced by index, so back-edges never create owning cycles;
//! child nodes are always resolved through lookup.
//!
//! Slot continuation semantics:
//! - `None` child: the slot is *recurrent*, the exchange stays in the current
//!   node and more messages of the same shape may follow.
//! - child with no slots: the slot is *terminal*, the exchange half ends.
//! - child with slots: the exchange transitions into that node.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Index of a node inside one [`ProtocolGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef(usize);

impl NodeRef {
    /// Returns the underlying index.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Slot {
    name: String,
    forward: Option<NodeRef>,
    backward: Option<NodeRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Node {
    slots: BTreeMap<u64, Slot>,
}

/// An immutable protocol graph.
///
/// Built once through [`GraphBuilder`] and then only read. Cloning is cheap
/// relative to its size and the graph is usually shared behind an `Arc` via
/// [`ProtocolGraph::into_root`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolGraph {
    nodes: Vec<Node>,
    root: NodeRef,
}

// Graphs arrive over the wire in membership announcements, so deserialization
// re-checks every node reference; cursors index the node table without bounds
// checks afterwards.
impl<'de> Deserialize<'de> for ProtocolGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            nodes: Vec<Node>,
            root: NodeRef,
        }
        let raw = Raw::deserialize(deserializer)?;
        let graph = ProtocolGraph { nodes: raw.nodes, root: raw.root };
        graph.validate().map_err(serde::de::Error::custom)?;
        Ok(graph)
    }
}

impl ProtocolGraph {
    /// Starts building a graph. Node 0 is the root.
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Wraps the graph in an `Arc` and returns a cursor at its root node.
    pub fn into_root(self) -> GraphNode {
        Self::root_of(Arc::new(self))
    }

    /// Returns a cursor at the root node of an already shared graph.
    pub fn root_of(graph: Arc<Self>) -> GraphNode {
        let node = graph.root;
        GraphNode { graph, node }
    }

    /// Checks that the root and every slot continuation reference an existing
    /// node.
    fn validate(&self) -> Result<()> {
        let len = self.nodes.len();
        let check = |node: NodeRef| {
            if node.index() < len {
                Ok(())
            } else {
                Err(ProtocolError::InvalidNodeRef { node: node.index(), len })
            }
        };
        check(self.root)?;
        for node in &self.nodes {
            for slot in node.slots.values() {
                if let Some(fwd) = slot.forward {
                    check(fwd)?;
                }
                if let Some(bwd) = slot.backward {
                    check(bwd)?;
                }
            }
        }
        Ok(())
    }

    /// Builds the graph of a plain request/response protocol: a single
    /// initiating slot whose forward half ends immediately and whose backward
    /// half accepts one `value` message.
    pub fn request_response(event_id: u64, name: &str) -> Self {
        let mut builder = GraphBuilder::new();
        let done = builder.node();
        let value = builder.node();
        builder.slot(value, 0, "value", Some(done), None);
        builder.slot(builder.root(), event_id, name, Some(done), Some(value));
        builder.build().expect("static graph is well formed")
    }

    /// Builds the graph of a duplex streaming protocol: after the initiating
    /// slot, both halves carry any number of `write` messages and end with
    /// `close` (the backward half may also end with `error`).
    pub fn duplex_streaming(event_id: u64, name: &str) -> Self {
        let mut builder = GraphBuilder::new();
        let done = builder.node();
        let forward = builder.node();
        builder.slot(forward, 0, "write", None, None);
        builder.slot(forward, 2, "close", Some(done), None);
        let backward = builder.node();
        builder.slot(backward, 0, "write", None, None);
        builder.slot(backward, 1, "error", Some(done), None);
        builder.slot(backward, 2, "close", Some(done), None);
        builder.slot(builder.root(), event_id, name, Some(forward), Some(backward));
        builder.build().expect("static graph is well formed")
    }
}

/// Incrementally builds a [`ProtocolGraph`].
///
/// All node references are validated in [`GraphBuilder::build`], so a slot may
/// reference a node allocated later.
#[derive(Debug)]
pub struct GraphBuilder {
    node_count: usize,
    slots: Vec<(NodeRef, u64, Slot)>,
}

impl GraphBuilder {
    fn new() -> Self {
        // node 0 always exists and is the root
        Self { node_count: 1, slots: Vec::new() }
    }

    /// The root node of the graph under construction.
    pub fn root(&self) -> NodeRef {
        NodeRef(0)
    }

    /// Allocates a fresh, empty node.
    pub fn node(&mut self) -> NodeRef {
        let id = NodeRef(self.node_count);
        self.node_count += 1;
        id
    }

    /// Defines a slot inside `node`. `forward`/`backward` name the child nodes
    /// governing each half of the exchange after this message, or `None` for
    /// a recurrent transition.
    pub fn slot(
        &mut self,
        node: NodeRef,
        id: u64,
        name: &str,
        forward: Option<NodeRef>,
        backward: Option<NodeRef>,
    ) -> &mut Self {
        self.slots.push((node, id, Slot { name: name.to_string(), forward, backward }));
        self
    }

    /// Validates every node reference and produces the immutable graph.
    pub fn build(self) -> Result<ProtocolGraph> {
        let len = self.node_count;
        let check = |node: NodeRef| {
            if node.index() < len {
                Ok(())
            } else {
                Err(ProtocolError::InvalidNodeRef { node: node.index(), len })
            }
        };
        let mut nodes = vec![Node::default(); len];
        for (node, id, slot) in self.slots {
            check(node)?;
            if let Some(fwd) = slot.forward {
                check(fwd)?;
            }
            if let Some(bwd) = slot.backward {
                check(bwd)?;
            }
            nodes[node.index()].slots.insert(id, slot);
        }
        Ok(ProtocolGraph { nodes, root: NodeRef(0) })
    }
}

/// A cursor into one node of a shared protocol graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    graph: Arc<ProtocolGraph>,
    node: NodeRef,
}

/// Resolved information about one slot, with child cursors already built.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    /// Slot name as defined in the graph.
    pub name: String,
    /// Forward continuation, `None` for a recurrent slot.
    pub forward: Option<GraphNode>,
    /// Backward continuation, `None` for a recurrent slot.
    pub backward: Option<GraphNode>,
}

/// A slot that may legally start a new exchange: both continuations exist.
#[derive(Debug, Clone)]
pub struct InitiatingSlot {
    /// Slot name as defined in the graph.
    pub name: String,
    /// Graph governing the forward half of the exchange.
    pub forward: GraphNode,
    /// Graph governing the backward half of the exchange.
    pub backward: GraphNode,
}

impl GraphNode {
    /// The shared graph this cursor points into.
    pub fn graph(&self) -> Arc<ProtocolGraph> {
        Arc::clone(&self.graph)
    }

    /// Whether this node defines no slots, i.e. the exchange half has ended.
    pub fn is_terminal(&self) -> bool {
        self.graph.nodes[self.node.index()].slots.is_empty()
    }

    /// Slot ids defined at this node, in ascending order.
    pub fn slot_ids(&self) -> Vec<u64> {
        self.graph.nodes[self.node.index()].slots.keys().copied().collect()
    }

    /// Resolves a slot at this node. `dispatch` only labels the error.
    pub fn lookup(&self, slot_id: u64, dispatch: &str) -> Result<SlotInfo> {
        let node = &self.graph.nodes[self.node.index()];
        let slot = node.slots.get(&slot_id).ok_or_else(|| ProtocolError::SlotNotFound {
            slot_id,
            dispatch: dispatch.to_string(),
        })?;
        let child = |node: Option<NodeRef>| {
            node.map(|node| GraphNode { graph: Arc::clone(&self.graph), node })
        };
        Ok(SlotInfo {
            name: slot.name.clone(),
            forward: child(slot.forward),
            backward: child(slot.backward),
        })
    }

    /// Resolves a slot and confirms it may initiate a fresh exchange.
    ///
    /// A slot missing either continuation is only reachable inside an already
    /// open exchange; using it to initiate is a protocol error.
    pub fn initiating(&self, slot_id: u64, dispatch: &str) -> Result<InitiatingSlot> {
        let info = self.lookup(slot_id, dispatch)?;
        let name = info.name;
        let forward = info.forward.ok_or_else(|| ProtocolError::RecurrentInitiation {
            slot_id,
            name: name.clone(),
            side: "forward",
        })?;
        let backward = info.backward.ok_or_else(|| ProtocolError::RecurrentInitiation {
            slot_id,
            name: name.clone(),
            side: "backward",
        })?;
        Ok(InitiatingSlot { name, forward, backward })
    }
}
