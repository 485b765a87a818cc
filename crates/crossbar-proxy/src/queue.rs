//! Invocation queue.
//!
//! Holds whole invocations that could not be dispatched yet because no
//! usable session exists, and replays them in strict FIFO order once one is
//! attached. Buffered invocations survive session loss and are retried
//! against the next session, up to the pool's retry ceiling (tracked per
//! invocation, enforced by the pool).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crossbar_protocol::{GraphNode, Message};

use crate::error::{codes, Result};
use crate::invocation::RouteDispatch;
use crate::session::Session;
use crate::stream::Stream;

/// A queueable invocation: the initiating message, its stream pair and the
/// protocol metadata needed to resume forwarding later.
pub struct PendingInvocation {
    /// The raw initiating message, replayed verbatim on execution.
    pub message: Message,
    /// Qualified invocation name.
    pub name: String,
    /// Forward stream the caller buffers outbound chunks into.
    pub forward: Arc<Stream>,
    /// Backward stream toward the original caller.
    pub backward: Arc<Stream>,
    /// Graph governing backend messages of this exchange.
    pub backward_protocol: GraphNode,
    /// Execution attempts made so far.
    pub attempts: u32,
}

impl PendingInvocation {
    /// Executes this invocation against a session: forks a channel, registers
    /// the backward route, sends the initiating message and flushes the
    /// forward stream behind it.
    ///
    /// An `Err` means the initiating message never left this node, so the
    /// caller may retry elsewhere. Once it is on the wire the backend may
    /// have started the exchange; a failure after that point must not be
    /// retried, so the exchange is torn down here and `Ok` is returned.
    pub fn execute(&self, session: &Session) -> Result<()> {
        let channel = session.fork();
        let route = Arc::new(RouteDispatch::new(
            format!("{}/backward", self.name),
            Arc::clone(&self.backward),
            self.backward_protocol.clone(),
        ));
        session.register_route(channel.id(), route);

        let sent = channel.send(
            self.message.event_id,
            &self.message.headers,
            self.message.payload.clone(),
        );
        if let Err(err) = sent {
            session.unregister_route(channel.id());
            return Err(err);
        }

        let attached = self
            .backward
            .attach_session(session.clone())
            .and_then(|()| self.forward.attach_session(session.clone()))
            .and_then(|()| self.forward.attach_channel(channel.clone()));
        if let Err(err) = attached {
            warn!(name = %self.name, %err, "exchange lost after initiation");
            session.unregister_route(channel.id());
            let _ = session.revoke(channel.id(), codes::SESSION_LOST);
            let _ = self.backward.discard(codes::SESSION_LOST, "connection lost after initiation");
            return Ok(());
        }
        debug!(name = %self.name, attempts = self.attempts, "executed invocation");
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    session: Option<Session>,
    pending: VecDeque<PendingInvocation>,
}

/// FIFO queue of not-yet-dispatched invocations for one peer.
#[derive(Default)]
pub struct InvocationQueue {
    state: Mutex<QueueState>,
}

impl InvocationQueue {
    /// Creates an empty, sessionless queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is currently attached.
    pub fn connected(&self) -> bool {
        self.state.lock().unwrap().session.is_some()
    }

    /// Number of buffered invocations.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Whether no invocations are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers an invocation at the tail without attempting execution.
    pub fn push(&self, invocation: PendingInvocation) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(invocation);
    }

    /// Records an invocation and returns its forward stream immediately, so
    /// the caller can start buffering outbound chunks before a backend is
    /// even chosen. Executes right away when a session is attached; on an
    /// execution failure the invocation is retained for the next session and
    /// the queue goes sessionless.
    pub fn append(&self, invocation: PendingInvocation) -> Arc<Stream> {
        let forward = Arc::clone(&invocation.forward);
        let mut state = self.state.lock().unwrap();
        match state.session.clone() {
            Some(session) => {
                if let Err(err) = invocation.execute(&session) {
                    warn!(name = %invocation.name, %err, "execution failed, requeueing");
                    let mut invocation = invocation;
                    invocation.attempts += 1;
                    state.pending.push_back(invocation);
                    state.session = None;
                }
            }
            None => state.pending.push_back(invocation),
        }
        forward
    }

    /// Attaches a session and drains the queue in strict FIFO order.
    ///
    /// When execution fails mid-drain the failing invocation (with its
    /// attempt counted) and everything behind it stay queued for the next
    /// attach, and the queue goes sessionless again. Returns the number of
    /// invocations executed.
    pub fn attach(&self, session: Session) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.session = Some(session.clone());
        let mut executed = 0;
        while let Some(invocation) = state.pending.pop_front() {
            match invocation.execute(&session) {
                Ok(()) => executed += 1,
                Err(err) => {
                    let mut invocation = invocation;
                    invocation.attempts += 1;
                    state.pending.push_front(invocation);
                    state.session = None;
                    return Err(err);
                }
            }
        }
        debug!(executed, "drained invocation queue");
        Ok(executed)
    }

    /// Marks the queue sessionless without touching buffered invocations;
    /// they survive to be retried against the next session.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.session = None;
    }

    /// Removes and returns every buffered invocation.
    pub fn take_all(&self) -> Vec<PendingInvocation> {
        let mut state = self.state.lock().unwrap();
        state.pending.drain(..).collect()
    }

    /// Removes and returns every buffered invocation whose attempt count
    /// exceeds `limit`; the rest stay queued in order.
    pub fn take_exhausted(&self, limit: u32) -> Vec<PendingInvocation> {
        let mut state = self.state.lock().unwrap();
        let (exhausted, kept): (Vec<PendingInvocation>, Vec<PendingInvocation>) =
            state.pending.drain(..).partition(|inv| inv.attempts > limit);
        state.pending = kept.into();
        exhausted
    }

    /// Merges another queue's pending invocations onto this queue's tail,
    /// preserving their relative order. With a session attached they are
    /// executed immediately, with the same failure semantics as
    /// [`InvocationQueue::attach`]. Returns the number executed.
    pub fn absorb(&self, other: &InvocationQueue) -> Result<usize> {
        let moved = other.take_all();
        if moved.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().unwrap();
        let mut executed = 0;
        let mut moved = VecDeque::from(moved);
        if let Some(session) = state.session.clone() {
            while let Some(invocation) = moved.pop_front() {
                match invocation.execute(&session) {
                    Ok(()) => executed += 1,
                    Err(err) => {
                        let mut invocation = invocation;
                        invocation.attempts += 1;
                        state.pending.push_back(invocation);
                        state.pending.extend(moved);
                        state.session = None;
                        return Err(err);
                    }
                }
            }
        } else {
            state.pending.extend(moved);
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Direction;
    use crate::testutil::{new_session, MockConnection};
    use bytes::Bytes;
    use crossbar_protocol::{Headers, ProtocolGraph};

    fn pending(tag: &str) -> PendingInvocation {
        let root = ProtocolGraph::request_response(5, "call").into_root();
        let slot = root.initiating(5, "svc").unwrap();
        PendingInvocation {
            message: Message::new(5, Headers::new(), Bytes::copy_from_slice(tag.as_bytes())),
            name: format!("svc/{tag}"),
            forward: Arc::new(Stream::new(Direction::Forward)),
            backward: Arc::new(Stream::new(Direction::Backward)),
            backward_protocol: slot.backward,
            attempts: 0,
        }
    }

    fn payloads(conn: &MockConnection) -> Vec<Bytes> {
        conn.sent().iter().map(|f| f.payload.clone()).collect()
    }

    #[test]
    fn test_fifo_replay_on_attach() {
        let queue = InvocationQueue::new();
        queue.push(pending("i1"));
        queue.push(pending("i2"));
        queue.push(pending("i3"));
        assert!(!queue.connected());

        let (session, conn) = new_session();
        let executed = queue.attach(session).unwrap();
        assert_eq!(executed, 3);
        assert!(queue.is_empty());
        assert_eq!(
            payloads(&conn),
            vec![Bytes::from_static(b"i1"), Bytes::from_static(b"i2"), Bytes::from_static(b"i3")]
        );
    }

    #[test]
    fn test_append_executes_when_connected() {
        let queue = InvocationQueue::new();
        let (session, conn) = new_session();
        queue.attach(session).unwrap();

        queue.append(pending("now"));
        assert!(queue.is_empty());
        assert_eq!(conn.sent().len(), 1);
    }

    #[test]
    fn test_append_buffers_when_disconnected() {
        let queue = InvocationQueue::new();
        let forward = queue.append(pending("later"));
        assert_eq!(queue.len(), 1);
        assert!(!forward.is_attached());
    }

    #[test]
    fn test_failed_drain_retains_remainder_in_order() {
        let queue = InvocationQueue::new();
        queue.push(pending("i1"));
        queue.push(pending("i2"));

        let (session, conn) = new_session();
        conn.fail_sends(true);
        assert!(queue.attach(session).is_err());
        assert!(!queue.connected());
        assert_eq!(queue.len(), 2);

        let drained = queue.take_all();
        assert_eq!(drained[0].message.payload.as_ref(), b"i1");
        assert_eq!(drained[0].attempts, 1);
        assert_eq!(drained[1].attempts, 0);
    }

    #[test]
    fn test_take_exhausted_splits_by_attempts() {
        let queue = InvocationQueue::new();
        queue.push(pending("fresh"));
        let mut worn = pending("worn");
        worn.attempts = 3;
        queue.push(worn);

        let exhausted = queue.take_exhausted(2);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].message.payload.as_ref(), b"worn");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_all()[0].message.payload.as_ref(), b"fresh");
    }

    #[test]
    fn test_post_send_failure_tears_down_instead_of_retrying() {
        let (session, conn) = new_session();
        let inv = pending("half");
        // buffered chunk forces a flush when the channel attaches
        inv.forward.append(Bytes::from_static(b"tail"), 5, Headers::new()).unwrap();
        conn.fail_after(1);

        // the initiating message reached the wire, so this is not retryable
        inv.execute(&session).unwrap();
        assert!(inv.backward.is_discarded());
        assert!(session.idle());
        assert_eq!(conn.sent().len(), 1);
        assert_eq!(conn.sent()[0].payload.as_ref(), b"half");
    }

    #[test]
    fn test_disconnect_keeps_buffered_invocations() {
        let queue = InvocationQueue::new();
        let (session, _conn) = new_session();
        queue.attach(session).unwrap();
        queue.disconnect();
        queue.append(pending("kept"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_absorb_preserves_relative_order() {
        let left = InvocationQueue::new();
        left.push(pending("a1"));
        let right = InvocationQueue::new();
        right.push(pending("b1"));
        right.push(pending("b2"));

        left.absorb(&right).unwrap();
        assert!(right.is_empty());

        let (session, conn) = new_session();
        left.attach(session).unwrap();
        assert_eq!(
            payloads(&conn),
            vec![Bytes::from_static(b"a1"), Bytes::from_static(b"b1"), Bytes::from_static(b"b2")]
        );
    }

    #[test]
    fn test_absorb_executes_directly_when_connected() {
        let left = InvocationQueue::new();
        let (session, conn) = new_session();
        left.attach(session).unwrap();

        let right = InvocationQueue::new();
        right.push(pending("b1"));
        let executed = left.absorb(&right).unwrap();
        assert_eq!(executed, 1);
        assert_eq!(conn.sent().len(), 1);
    }
}
