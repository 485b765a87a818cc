//! Ordered, bufferable stream of outbound operations.
//!
//! A [`Stream`] carries one direction of one logical RPC exchange. Operations
//! appended before a target is attached are buffered in arrival order and
//! flushed in that exact order on attach; afterwards appends flush straight
//! through. Both paths run under the state mutex, so a concurrent append can
//! never interleave ahead of a flush.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crossbar_protocol::Headers;

use crate::error::{ProxyError, Result};
use crate::session::{Channel, Session};
use crate::transport::Upstream;

/// Direction of a stream, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the backend; the target is eventually a session channel.
    Forward,
    /// Toward the original caller; the target is an upstream handle.
    Backward,
}

/// One buffered outbound operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Protocol slot id.
    pub event_id: u64,
    /// Header metadata.
    pub headers: Headers,
    /// Opaque payload.
    pub payload: Bytes,
}

enum Terminal {
    Closed { headers: Headers },
    Discarded { code: u32, reason: String },
}

struct StreamState {
    buffer: VecDeque<Operation>,
    channel: Option<Channel>,
    upstream: Option<Arc<dyn Upstream>>,
    session: Option<Session>,
    terminal: Option<Terminal>,
    delivered: bool,
}

/// An ordered, appendable log of outbound operations for one exchange half.
pub struct Stream {
    direction: Direction,
    state: Mutex<StreamState>,
}

impl Stream {
    /// Creates an unattached stream.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: Mutex::new(StreamState {
                buffer: VecDeque::new(),
                channel: None,
                upstream: None,
                session: None,
                terminal: None,
                delivered: false,
            }),
        }
    }

    /// The fixed direction of this stream.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Appends one operation: buffered until a target is attached, flushed
    /// immediately afterwards. Rejected once the stream is terminal.
    pub fn append(&self, payload: Bytes, event_id: u64, headers: Headers) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &state.terminal {
            Some(Terminal::Discarded { code, .. }) => {
                return Err(ProxyError::StreamDiscarded { code: *code });
            }
            Some(Terminal::Closed { .. }) => return Err(ProxyError::StreamClosed),
            None => {}
        }
        let op = Operation { event_id, headers, payload };
        if self.has_target(&state) {
            self.flush_one(&state, &op)
        } else {
            state.buffer.push_back(op);
            Ok(())
        }
    }

    /// Attaches a session channel and flushes the buffer in order.
    ///
    /// On a flush failure the unflushed remainder stays buffered, beginning
    /// with the failing operation, and no target is retained.
    pub fn attach_channel(&self, channel: Channel) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while let Some(op) = state.buffer.pop_front() {
            if let Err(err) = channel.send(op.event_id, &op.headers, op.payload.clone()) {
                state.buffer.push_front(op);
                return Err(err);
            }
        }
        state.channel = Some(channel);
        self.try_finalize(&mut state)
    }

    /// Attaches the caller's upstream handle and flushes the buffer in order.
    pub fn attach_upstream(&self, upstream: Arc<dyn Upstream>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while let Some(op) = state.buffer.pop_front() {
            if let Err(err) = upstream.write(&op.headers, op.payload.clone()) {
                state.buffer.push_front(op);
                return Err(err);
            }
        }
        state.upstream = Some(upstream);
        self.try_finalize(&mut state)
    }

    /// Records the session carrying this exchange.
    ///
    /// Keeps the connection alive for as long as the stream exists and gives
    /// forward discards a path to revoke their channel.
    pub fn attach_session(&self, session: Session) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.session = Some(session);
        self.try_finalize(&mut state)
    }

    /// Sets the terminal discard code. First call wins; later calls are
    /// no-ops. Buffered but unflushed operations are dropped and the target,
    /// once attached, is notified exactly once.
    pub fn discard(&self, code: u32, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_some() {
            return Ok(());
        }
        debug!(code, reason, direction = ?self.direction, "discarding stream");
        state.buffer.clear();
        state.terminal = Some(Terminal::Discarded { code, reason: reason.to_string() });
        self.try_finalize(&mut state)
    }

    /// Ends the stream cleanly. Flushes anything still buffered, then closes
    /// the attached upstream for backward streams. Idempotent.
    pub fn close(&self, headers: &Headers) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_some() {
            return Ok(());
        }
        if self.has_target(&state) {
            while let Some(op) = state.buffer.pop_front() {
                if let Err(err) = self.flush_one(&state, &op) {
                    state.buffer.push_front(op);
                    return Err(err);
                }
            }
        }
        state.terminal = Some(Terminal::Closed { headers: headers.clone() });
        self.try_finalize(&mut state)
    }

    /// Number of buffered, not yet flushed operations.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    /// Whether a terminal discard code has been set.
    pub fn is_discarded(&self) -> bool {
        matches!(self.state.lock().unwrap().terminal, Some(Terminal::Discarded { .. }))
    }

    /// Whether a flush target is attached.
    pub fn is_attached(&self) -> bool {
        self.has_target(&self.state.lock().unwrap())
    }

    fn has_target(&self, state: &StreamState) -> bool {
        match self.direction {
            Direction::Forward => state.channel.is_some(),
            Direction::Backward => state.upstream.is_some(),
        }
    }

    fn flush_one(&self, state: &StreamState, op: &Operation) -> Result<()> {
        match self.direction {
            Direction::Forward => match &state.channel {
                Some(channel) => channel.send(op.event_id, &op.headers, op.payload.clone()),
                None => Err(ProxyError::StreamNotAttached),
            },
            Direction::Backward => match &state.upstream {
                Some(upstream) => upstream.write(&op.headers, op.payload.clone()),
                None => Err(ProxyError::StreamNotAttached),
            },
        }
    }

    /// Delivers the terminal notification once the necessary target exists.
    fn try_finalize(&self, state: &mut StreamState) -> Result<()> {
        if state.delivered {
            return Ok(());
        }
        match (&state.terminal, self.direction) {
            (None, _) => Ok(()),
            (Some(Terminal::Discarded { code, .. }), Direction::Forward) => {
                if let (Some(session), Some(channel)) = (&state.session, &state.channel) {
                    session.revoke(channel.id(), *code)?;
                    state.delivered = true;
                }
                Ok(())
            }
            (Some(Terminal::Discarded { code, reason }), Direction::Backward) => {
                if let Some(upstream) = &state.upstream {
                    upstream.error(&Headers::new(), *code, reason)?;
                    state.delivered = true;
                }
                Ok(())
            }
            (Some(Terminal::Closed { headers }), Direction::Backward) => {
                if let Some(upstream) = &state.upstream {
                    upstream.close(headers)?;
                    state.delivered = true;
                }
                Ok(())
            }
            (Some(Terminal::Closed { .. }), Direction::Forward) => {
                // forward closure is expressed by the protocol's own terminal
                // message; nothing extra crosses the wire
                state.delivered = true;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("direction", &self.direction)
            .field("buffered", &self.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::session::Session;
    use crate::testutil::{MockConnection, MockUpstream};
    use std::sync::atomic::AtomicUsize;

    fn forward_pair() -> (Stream, MockConnection, Session) {
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn.clone()), Arc::new(AtomicUsize::new(0)));
        (Stream::new(Direction::Forward), conn, session)
    }

    #[test]
    fn test_fifo_flush_on_attach() {
        let (stream, conn, session) = forward_pair();
        stream.append(Bytes::from_static(b"a"), 0, Headers::new()).unwrap();
        stream.append(Bytes::from_static(b"b"), 0, Headers::new()).unwrap();
        stream.append(Bytes::from_static(b"c"), 2, Headers::new()).unwrap();
        assert_eq!(stream.buffered(), 3);

        stream.attach_channel(session.fork()).unwrap();
        assert_eq!(stream.buffered(), 0);

        let sent = conn.sent();
        let payloads: Vec<&[u8]> = sent.iter().map(|f| f.payload.as_ref()).collect();
        assert_eq!(payloads, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }

    #[test]
    fn test_append_after_attach_flushes_immediately() {
        let (stream, conn, session) = forward_pair();
        stream.attach_channel(session.fork()).unwrap();
        stream.append(Bytes::from_static(b"x"), 0, Headers::new()).unwrap();
        assert_eq!(stream.buffered(), 0);
        assert_eq!(conn.sent().len(), 1);
    }

    #[test]
    fn test_backward_flushes_to_upstream_in_order() {
        let stream = Stream::new(Direction::Backward);
        stream.append(Bytes::from_static(b"1"), 0, Headers::new()).unwrap();
        stream.append(Bytes::from_static(b"2"), 0, Headers::new()).unwrap();

        let upstream = MockUpstream::shared();
        stream.attach_upstream(upstream.clone()).unwrap();

        let chunks = upstream.chunks();
        assert_eq!(chunks, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
    }

    #[test]
    fn test_discard_is_idempotent_first_code_wins() {
        let stream = Stream::new(Direction::Backward);
        let upstream = MockUpstream::shared();
        stream.attach_upstream(upstream.clone()).unwrap();

        stream.discard(codes::SERVICE_UNAVAILABLE, "no peers").unwrap();
        stream.discard(codes::CANCELLED, "second").unwrap();

        let errors = upstream.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, codes::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_discard_drops_buffered_operations() {
        let stream = Stream::new(Direction::Backward);
        stream.append(Bytes::from_static(b"stale"), 0, Headers::new()).unwrap();
        stream.discard(codes::CANCELLED, "gone").unwrap();
        assert_eq!(stream.buffered(), 0);

        // late attach still delivers the error, never the dropped chunk
        let upstream = MockUpstream::shared();
        stream.attach_upstream(upstream.clone()).unwrap();
        assert!(upstream.chunks().is_empty());
        assert_eq!(upstream.errors().len(), 1);
    }

    #[test]
    fn test_append_after_discard_is_rejected() {
        let stream = Stream::new(Direction::Forward);
        stream.discard(codes::CANCELLED, "gone").unwrap();
        let err = stream.append(Bytes::new(), 0, Headers::new()).unwrap_err();
        assert!(matches!(err, ProxyError::StreamDiscarded { code: codes::CANCELLED }));
    }

    #[test]
    fn test_forward_discard_revokes_channel() {
        let (stream, conn, session) = forward_pair();
        let channel = session.fork();
        let channel_id = channel.id();
        stream.attach_session(session.clone()).unwrap();
        stream.attach_channel(channel).unwrap();

        stream.discard(codes::SESSION_LOST, "peer gone").unwrap();

        let sent = conn.sent();
        let revoke = sent.last().unwrap();
        assert!(revoke.is_revoke());
        assert_eq!(revoke.channel_id, channel_id);
        assert_eq!(revoke.revoke_code(), Some(codes::SESSION_LOST));
    }

    #[test]
    fn test_close_delivers_once_and_rejects_appends() {
        let stream = Stream::new(Direction::Backward);
        let upstream = MockUpstream::shared();
        stream.attach_upstream(upstream.clone()).unwrap();

        stream.close(&Headers::new()).unwrap();
        stream.close(&Headers::new()).unwrap();
        assert_eq!(upstream.closed(), 1);

        let err = stream.append(Bytes::new(), 0, Headers::new()).unwrap_err();
        assert!(matches!(err, ProxyError::StreamClosed));
    }

    #[test]
    fn test_flush_failure_retains_remainder() {
        let (stream, conn, session) = forward_pair();
        stream.append(Bytes::from_static(b"a"), 0, Headers::new()).unwrap();
        stream.append(Bytes::from_static(b"b"), 0, Headers::new()).unwrap();

        conn.fail_sends(true);
        assert!(stream.attach_channel(session.fork()).is_err());
        assert_eq!(stream.buffered(), 2);
        assert!(!stream.is_attached());

        conn.fail_sends(false);
        stream.attach_channel(session.fork()).unwrap();
        assert_eq!(stream.buffered(), 0);
        assert_eq!(conn.sent().len(), 2);
    }
}
