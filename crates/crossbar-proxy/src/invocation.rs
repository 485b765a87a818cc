//! Invocation construction and per-message protocol routing.
//!
//! [`Invocation`] validates that an incoming message may start a fresh
//! exchange (its slot must define both a forward and a backward
//! continuation) and owns the resulting stream pair. [`RouteDispatch`] is the
//! per-direction cursor that walks the protocol graph for every follow-up
//! message inside the exchange.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crossbar_protocol::{GraphNode, Message};

use crate::error::{ProxyError, Result};
use crate::queue::PendingInvocation;
use crate::stream::{Direction, Stream};

/// Outcome of routing one message through a protocol node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The slot is recurrent; the exchange stays in the current node.
    Recurrent,
    /// The exchange moved into the slot's continuation node.
    Next,
    /// The slot ended this half of the exchange.
    Terminal,
}

/// One validated initiating request plus its stream pair.
pub struct Invocation {
    name: String,
    message: Message,
    forward_protocol: GraphNode,
    backward_protocol: GraphNode,
    forward: Arc<Stream>,
    backward: Arc<Stream>,
}

impl Invocation {
    /// Validates the initiating message against the protocol graph.
    ///
    /// Fails with a protocol error when the slot is unknown or lacks either
    /// continuation; such failures are reported to the caller immediately and
    /// never retried, since they indicate a protocol or version mismatch.
    pub fn new(
        message: Message,
        graph: &GraphNode,
        backward: Arc<Stream>,
        dispatch: &str,
    ) -> Result<Self> {
        let slot = graph.initiating(message.event_id, dispatch)?;
        let name = format!("{}/{}", dispatch, slot.name);
        debug!(%name, event_id = message.event_id, "constructed invocation");
        Ok(Self {
            name,
            message,
            forward_protocol: slot.forward,
            backward_protocol: slot.backward,
            forward: Arc::new(Stream::new(Direction::Forward)),
            backward,
        })
    }

    /// Qualified name of this invocation (`dispatch/slot`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Graph governing client messages that follow the initiating one.
    pub fn forward_protocol(&self) -> &GraphNode {
        &self.forward_protocol
    }

    /// Graph governing backend messages of this exchange.
    pub fn backward_protocol(&self) -> &GraphNode {
        &self.backward_protocol
    }

    /// The forward stream the caller may start buffering into right away.
    pub fn forward_stream(&self) -> Arc<Stream> {
        Arc::clone(&self.forward)
    }

    /// The backward stream toward the original caller.
    pub fn backward_stream(&self) -> Arc<Stream> {
        Arc::clone(&self.backward)
    }

    /// Builds the dispatch that routes the caller's follow-up messages into
    /// the forward stream.
    pub fn client_route(&self) -> Arc<RouteDispatch> {
        Arc::new(RouteDispatch::new(
            format!("{}/forward", self.name),
            Arc::clone(&self.forward),
            self.forward_protocol.clone(),
        ))
    }

    /// Converts into the queueable form used by pools and queues.
    pub fn into_pending(self) -> PendingInvocation {
        PendingInvocation {
            message: self.message,
            name: self.name,
            forward: self.forward,
            backward: self.backward,
            backward_protocol: self.backward_protocol,
            attempts: 0,
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.name)
            .field("event_id", &self.message.event_id)
            .finish()
    }
}

struct RouteState {
    name: String,
    node: GraphNode,
    finished: bool,
}

/// Routes the messages of one exchange half: appends each to its stream and
/// advances through the protocol graph.
pub struct RouteDispatch {
    stream: Arc<Stream>,
    state: Mutex<RouteState>,
}

impl RouteDispatch {
    /// Creates a dispatch positioned at `node`.
    pub fn new(name: String, stream: Arc<Stream>, node: GraphNode) -> Self {
        Self { stream, state: Mutex::new(RouteState { name, node, finished: false }) }
    }

    /// Current qualified dispatch name, extended at every transition.
    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    /// The stream this dispatch feeds.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Routes one message: resolves its slot in the current node, appends it
    /// to the stream and advances the cursor. A terminal transition closes
    /// the stream; for a backward stream the terminal message itself is not
    /// data — the caller observes it as the upstream `close`, never as a
    /// response chunk.
    pub fn process(&self, message: &Message) -> Result<Transition> {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return Err(ProxyError::ExchangeFinished { name: state.name.clone() });
        }
        let slot = state.node.lookup(message.event_id, &state.name)?;
        match slot.forward {
            None => {
                self.stream.append(
                    message.payload.clone(),
                    message.event_id,
                    message.headers.clone(),
                )?;
                Ok(Transition::Recurrent)
            }
            Some(next) if next.is_terminal() => {
                state.finished = true;
                if self.stream.direction() == Direction::Forward {
                    // the terminal message still has to cross the wire
                    self.stream.append(
                        message.payload.clone(),
                        message.event_id,
                        message.headers.clone(),
                    )?;
                }
                self.stream.close(&message.headers)?;
                debug!(name = %state.name, event_id = message.event_id, "exchange finished");
                Ok(Transition::Terminal)
            }
            Some(next) => {
                self.stream.append(
                    message.payload.clone(),
                    message.event_id,
                    message.headers.clone(),
                )?;
                state.name = format!("{}/{}", state.name, slot.name);
                state.node = next;
                Ok(Transition::Next)
            }
        }
    }

    /// Discards the underlying stream with a terminal code.
    pub fn discard(&self, code: u32, reason: &str) -> Result<()> {
        self.stream.discard(code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::testutil::{new_session, MockUpstream};
    use bytes::Bytes;
    use crossbar_protocol::{Headers, ProtocolError, ProtocolGraph};

    fn backward_stream() -> Arc<Stream> {
        Arc::new(Stream::new(Direction::Backward))
    }

    #[test]
    fn test_unknown_slot_fails_immediately() {
        let root = ProtocolGraph::request_response(5, "call").into_root();
        let message = Message::new(99, Headers::new(), "x");
        let err = Invocation::new(message, &root, backward_stream(), "svc").unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Protocol(ProtocolError::SlotNotFound { slot_id: 99, .. })
        ));
    }

    #[test]
    fn test_invocation_exposes_both_protocols() {
        let root = ProtocolGraph::duplex_streaming(0, "enqueue").into_root();
        let message = Message::new(0, Headers::new(), "req");
        let inv = Invocation::new(message, &root, backward_stream(), "svc").unwrap();
        assert_eq!(inv.name(), "svc/enqueue");
        assert_eq!(inv.forward_protocol().slot_ids(), vec![0, 2]);
        assert_eq!(inv.backward_protocol().slot_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_route_recurrent_then_terminal() {
        let root = ProtocolGraph::duplex_streaming(0, "enqueue").into_root();
        let inv = Invocation::new(
            Message::new(0, Headers::new(), "req"),
            &root,
            backward_stream(),
            "svc",
        )
        .unwrap();

        let upstream = MockUpstream::shared();
        let backward = inv.backward_stream();
        backward.attach_upstream(upstream.clone()).unwrap();

        let route = RouteDispatch::new(
            "svc/enqueue/backward".into(),
            backward,
            inv.backward_protocol().clone(),
        );
        assert_eq!(
            route.process(&Message::new(0, Headers::new(), "chunk1")).unwrap(),
            Transition::Recurrent
        );
        assert_eq!(
            route.process(&Message::new(0, Headers::new(), "chunk2")).unwrap(),
            Transition::Recurrent
        );
        assert_eq!(
            route.process(&Message::new(2, Headers::new(), "")).unwrap(),
            Transition::Terminal
        );

        // the terminal message is observed as the close, not as a data chunk
        assert_eq!(upstream.chunks().len(), 2);
        assert_eq!(upstream.closed(), 1);

        // exchanges do not accept traffic after their terminal transition
        let err = route.process(&Message::new(0, Headers::new(), "late")).unwrap_err();
        assert!(matches!(err, ProxyError::ExchangeFinished { .. }));
    }

    #[test]
    fn test_forward_terminal_message_still_flushes() {
        let (session, conn) = new_session();
        let root = ProtocolGraph::duplex_streaming(0, "enqueue").into_root();
        let inv = Invocation::new(
            Message::new(0, Headers::new(), "req"),
            &root,
            backward_stream(),
            "svc",
        )
        .unwrap();
        inv.forward_stream().attach_channel(session.fork()).unwrap();

        let route = inv.client_route();
        route.process(&Message::new(0, Headers::new(), "w1")).unwrap();
        assert_eq!(
            route.process(&Message::new(2, Headers::new(), "")).unwrap(),
            Transition::Terminal
        );

        // the write and the protocol's own close message both reach the wire
        let payloads: Vec<Bytes> = conn.sent().iter().map(|f| f.payload.clone()).collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"w1"), Bytes::new()]);
    }

    #[test]
    fn test_route_unknown_slot_is_protocol_error() {
        let root = ProtocolGraph::duplex_streaming(0, "enqueue").into_root();
        let inv = Invocation::new(
            Message::new(0, Headers::new(), "req"),
            &root,
            backward_stream(),
            "svc",
        )
        .unwrap();
        let route = inv.client_route();
        let err = route.process(&Message::new(77, Headers::new(), "x")).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(ProtocolError::SlotNotFound { .. })));
    }

    #[test]
    fn test_route_discard_reaches_stream() {
        let upstream = MockUpstream::shared();
        let stream = backward_stream();
        stream.attach_upstream(upstream.clone()).unwrap();
        let root = ProtocolGraph::duplex_streaming(0, "enqueue").into_root();
        let slot = root.initiating(0, "svc").unwrap();
        let route = RouteDispatch::new("svc".into(), stream, slot.backward);

        route.discard(codes::SESSION_LOST, "gone").unwrap();
        assert_eq!(upstream.errors(), vec![(codes::SESSION_LOST, "gone".to_string())]);
    }
}
