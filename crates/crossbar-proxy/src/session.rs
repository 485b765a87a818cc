//! Reference-counted session wrapper.
//!
//! A [`Session`] wraps one established connection to a peer. It is cloned
//! freely: the pool keeps one handle as "the current connection" while every
//! in-flight stream that was attached before a rebalance holds its own. The
//! last handle to drop detaches the raw connection and decrements the shared
//! live-connection gauge, each exactly once, on every path — the pairing
//! lives in `Drop` and cannot be skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crossbar_protocol::{Frame, Headers};

use crate::error::{codes, ProxyError, Result};
use crate::invocation::{RouteDispatch, Transition};
use crate::transport::RawConnection;

struct SessionInner {
    conn: Box<dyn RawConnection>,
    next_channel: AtomicU64,
    routes: Mutex<HashMap<u64, Arc<RouteDispatch>>>,
    live_gauge: Arc<AtomicUsize>,
    created_at: Instant,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        debug!("detaching session");
        self.conn.detach();
        self.live_gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cloneable handle to one live connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wraps a raw connection. Increments the live-connection gauge once.
    pub fn new(conn: Box<dyn RawConnection>, live_gauge: Arc<AtomicUsize>) -> Self {
        live_gauge.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(SessionInner {
                conn,
                next_channel: AtomicU64::new(1),
                routes: Mutex::new(HashMap::new()),
                live_gauge,
                created_at: Instant::now(),
            }),
        }
    }

    /// Allocates a fresh logical channel over this connection.
    pub fn fork(&self) -> Channel {
        let channel_id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        Channel { session: self.clone(), channel_id }
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> Result<()> {
        self.inner.conn.send(frame)
    }

    /// Revokes a channel on the remote side with an error code.
    pub fn revoke(&self, channel_id: u64, code: u32) -> Result<()> {
        self.send_frame(Frame::revoke(channel_id, code))
    }

    /// Registers the dispatch that handles inbound frames for a channel.
    pub fn register_route(&self, channel_id: u64, route: Arc<RouteDispatch>) {
        let mut routes = self.inner.routes.lock().unwrap();
        routes.insert(channel_id, route);
    }

    /// Removes a channel's route, if any.
    pub fn unregister_route(&self, channel_id: u64) {
        let mut routes = self.inner.routes.lock().unwrap();
        routes.remove(&channel_id);
    }

    /// Feeds one inbound frame into the route owning its channel.
    ///
    /// This is the integration point for the transport read loop. Terminal
    /// transitions and errors drop the route, releasing the session reference
    /// held through its streams.
    pub fn handle_frame(&self, frame: Frame) -> Result<()> {
        let channel_id = frame.channel_id;
        if frame.is_revoke() {
            let code = frame.revoke_code().unwrap_or(codes::SESSION_LOST);
            let route = self.take_route(channel_id);
            return match route {
                Some(route) => route.discard(code, "channel revoked by peer"),
                None => Ok(()),
            };
        }

        let route = {
            let routes = self.inner.routes.lock().unwrap();
            routes.get(&channel_id).cloned()
        };
        let Some(route) = route else {
            warn!(channel_id, "dropping frame for unknown channel");
            return Err(ProxyError::UnknownChannel { channel_id });
        };

        match route.process(&frame.into_message()) {
            Ok(Transition::Terminal) => {
                self.unregister_route(channel_id);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                self.unregister_route(channel_id);
                let _ = route.discard(codes::PROTOCOL, &err.to_string());
                Err(err)
            }
        }
    }

    fn take_route(&self, channel_id: u64) -> Option<Arc<RouteDispatch>> {
        let mut routes = self.inner.routes.lock().unwrap();
        routes.remove(&channel_id)
    }

    /// Discards every open route with the given code, draining the table.
    ///
    /// Called when the connection is lost so route-held session references
    /// are released and pending callers observe the failure.
    pub fn discard_all(&self, code: u32, reason: &str) {
        let drained: Vec<_> = {
            let mut routes = self.inner.routes.lock().unwrap();
            routes.drain().collect()
        };
        for (channel_id, route) in drained {
            debug!(channel_id, code, "discarding route on session teardown");
            let _ = route.discard(code, reason);
        }
    }

    /// Whether no exchange is currently routed over this session.
    pub fn idle(&self) -> bool {
        self.inner.routes.lock().unwrap().is_empty()
    }

    /// Time since the connection was established.
    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("age", &self.age())
            .field("idle", &self.idle())
            .finish()
    }
}

/// One logical channel over a session.
#[derive(Clone)]
pub struct Channel {
    session: Session,
    channel_id: u64,
}

impl Channel {
    /// The channel id frames are tagged with.
    pub fn id(&self) -> u64 {
        self.channel_id
    }

    /// The session this channel belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Frames and writes one message on this channel.
    pub fn send(&self, event_id: u64, headers: &Headers, payload: bytes::Bytes) -> Result<()> {
        self.session.send_frame(Frame {
            channel_id: self.channel_id,
            event_id,
            headers: headers.clone(),
            payload,
        })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("channel_id", &self.channel_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockConnection;
    use bytes::Bytes;

    fn gauge() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_gauge_increments_on_create_and_decrements_on_drop() {
        let gauge = gauge();
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn.clone()), gauge.clone());
        assert_eq!(gauge.load(Ordering::SeqCst), 1);
        drop(session);
        assert_eq!(gauge.load(Ordering::SeqCst), 0);
        assert!(conn.is_detached());
    }

    #[test]
    fn test_gauge_single_decrement_regardless_of_release_order() {
        let gauge = gauge();
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn.clone()), gauge.clone());

        let holders: Vec<Session> = (0..4).map(|_| session.clone()).collect();
        assert_eq!(gauge.load(Ordering::SeqCst), 1);

        // release in scrambled order; only the last drop detaches
        drop(session);
        for holder in holders.into_iter().rev() {
            assert!(!conn.is_detached());
            assert_eq!(gauge.load(Ordering::SeqCst), 1);
            drop(holder);
        }
        assert_eq!(gauge.load(Ordering::SeqCst), 0);
        assert!(conn.is_detached());
    }

    #[test]
    fn test_fork_allocates_distinct_channels() {
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn), gauge());
        let a = session.fork();
        let b = session.fork();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_channel_send_frames_with_channel_id() {
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn.clone()), gauge());
        let channel = session.fork();
        channel.send(5, &Headers::new(), Bytes::from_static(b"hi")).unwrap();

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, channel.id());
        assert_eq!(sent[0].event_id, 5);
        assert_eq!(sent[0].payload.as_ref(), b"hi");
    }

    #[test]
    fn test_revoke_sends_control_frame() {
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn.clone()), gauge());
        session.revoke(9, codes::CANCELLED).unwrap();

        let sent = conn.sent();
        assert!(sent[0].is_revoke());
        assert_eq!(sent[0].revoke_code(), Some(codes::CANCELLED));
    }

    #[test]
    fn test_handle_frame_unknown_channel() {
        let conn = MockConnection::shared();
        let session = Session::new(Box::new(conn), gauge());
        let frame = Frame {
            channel_id: 404,
            event_id: 0,
            headers: Headers::new(),
            payload: Bytes::new(),
        };
        let err = session.handle_frame(frame).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownChannel { channel_id: 404 }));
    }
}
