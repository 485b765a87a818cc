//! Test doubles for the transport-facing traits.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crossbar_protocol::{Frame, Headers};

use crate::error::{ProxyError, Result};
use crate::session::Session;
use crate::transport::{Connector, RawConnection, Upstream};

/// Recording connection; cloneable handle over shared state.
#[derive(Clone)]
pub(crate) struct MockConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    sent: Mutex<Vec<Frame>>,
    detached: AtomicBool,
    fail: AtomicBool,
    allow: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn shared() -> Self {
        Self {
            inner: Arc::new(ConnInner {
                sent: Mutex::new(Vec::new()),
                detached: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                allow: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Lets the next `n` sends through, then fails every send after them.
    pub(crate) fn fail_after(&self, n: usize) {
        self.inner.allow.store(n, Ordering::SeqCst);
    }
}

impl RawConnection for MockConnection {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(ProxyError::ConnectionReset);
        }
        let allowed = self.inner.allow.load(Ordering::SeqCst);
        if allowed == 0 {
            return Err(ProxyError::ConnectionReset);
        }
        if allowed != usize::MAX {
            self.inner.allow.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn detach(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
    }
}

/// Builds a session over a fresh mock connection.
pub(crate) fn new_session() -> (Session, MockConnection) {
    let conn = MockConnection::shared();
    let session = Session::new(Box::new(conn.clone()), Arc::new(AtomicUsize::new(0)));
    (session, conn)
}

/// Scriptable connector recording every connection it hands out.
pub(crate) struct MockConnector {
    outcomes: Mutex<VecDeque<bool>>,
    connections: Mutex<Vec<MockConnection>>,
    fail_all: AtomicBool,
    fail_new_sends: AtomicBool,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            connections: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
            fail_new_sends: AtomicBool::new(false),
        })
    }

    /// Scripts the next `n` connect attempts to fail.
    pub(crate) fn fail_next(&self, n: usize) {
        let mut outcomes = self.outcomes.lock().unwrap();
        for _ in 0..n {
            outcomes.push_back(false);
        }
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// New connections come up with sends already failing.
    pub(crate) fn fail_new_sends(&self, fail: bool) {
        self.fail_new_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn connections(&self) -> Vec<MockConnection> {
        self.connections.lock().unwrap().clone()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoints: &[SocketAddr]) -> Result<Box<dyn RawConnection>> {
        let scripted_ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if !scripted_ok || self.fail_all.load(Ordering::SeqCst) {
            return Err(ProxyError::ConnectFailed {
                endpoints: endpoints.len(),
                reason: "scripted failure".into(),
            });
        }
        let conn = MockConnection::shared();
        if self.fail_new_sends.load(Ordering::SeqCst) {
            conn.fail_sends(true);
        }
        self.connections.lock().unwrap().push(conn.clone());
        Ok(Box::new(conn))
    }
}

/// Recording upstream handle.
pub(crate) struct MockUpstream {
    chunks: Mutex<Vec<Bytes>>,
    errors: Mutex<Vec<(u32, String)>>,
    closed: AtomicUsize,
}

impl MockUpstream {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn chunks(&self) -> Vec<Bytes> {
        self.chunks.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<(u32, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Upstream for MockUpstream {
    fn write(&self, _headers: &Headers, chunk: Bytes) -> Result<()> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    fn error(&self, _headers: &Headers, code: u32, reason: &str) -> Result<()> {
        self.errors.lock().unwrap().push((code, reason.to_string()));
        Ok(())
    }

    fn close(&self, _headers: &Headers) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls a condition until it holds or a couple of seconds elapse.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// A throwaway endpoint list for peers that only ever meet mock connectors.
pub(crate) fn endpoints() -> Vec<SocketAddr> {
    vec!["127.0.0.1:4500".parse().unwrap()]
}
