//! Per-invocation accounting.
//!
//! Every invocation that enters a pool opens an [`AccessSpan`]; when the
//! dispatch decision is made the span is finished with an outcome, which
//! emits one structured log line and bumps the shared counters surfaced
//! through the gateway's `info` output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// How an invocation left the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sent to a connected peer.
    Dispatched,
    /// Buffered for a future session.
    Queued,
    /// Terminally failed; the caller saw an error.
    Failed,
}

/// Monotonic counters over all invocations of one pool.
#[derive(Default)]
pub struct AccessLog {
    total: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AccessStats {
    /// Invocations accepted.
    pub total: u64,
    /// Invocations that terminally failed.
    pub failed: u64,
    /// Invocations that needed more than one execution attempt.
    pub retried: u64,
}

impl AccessLog {
    /// Opens a span for one invocation.
    pub fn begin(self: &Arc<Self>, name: &str, event_id: u64) -> AccessSpan {
        self.total.fetch_add(1, Ordering::Relaxed);
        AccessSpan {
            log: Arc::clone(self),
            name: name.to_string(),
            event_id,
            started: Instant::now(),
            attempts: 0,
            peer: None,
        }
    }

    /// Records a terminal failure that happened after the invocation's span
    /// already closed, e.g. a queued invocation exhausting its retries during
    /// a later replay.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn stats(&self) -> AccessStats {
        AccessStats {
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Accounting handle for one invocation.
pub struct AccessSpan {
    log: Arc<AccessLog>,
    name: String,
    event_id: u64,
    started: Instant,
    attempts: u32,
    peer: Option<Uuid>,
}

impl AccessSpan {
    /// Records one execution attempt against a peer.
    pub fn attempt(&mut self, peer: Uuid) {
        self.attempts += 1;
        self.peer = Some(peer);
    }

    /// Total attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Closes the span, logging it and updating the counters.
    pub fn finish(self, outcome: Outcome) {
        if outcome == Outcome::Failed {
            self.log.failed.fetch_add(1, Ordering::Relaxed);
        }
        if self.attempts > 1 {
            self.log.retried.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            name = %self.name,
            event_id = self.event_id,
            peer = ?self.peer,
            attempts = self.attempts,
            outcome = ?outcome,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "invocation"
        );
    }
}
