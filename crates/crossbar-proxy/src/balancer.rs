//! Peer selection strategies.
//!
//! A [`Balancer`] picks a target among the currently eligible peers. Returning
//! `None` is a soft outcome: the pool queues the invocation instead of failing
//! it. Strategies are registered by name in a [`BalancerRegistry`] so pools
//! can be configured without linking the choice in statically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::peer::Peer;

/// Chooses a peer among eligible candidates.
pub trait Balancer: Send + Sync + std::fmt::Debug {
    /// Picks one candidate, or `None` when no choice can be made. The
    /// candidate slice is never reordered by the caller between calls.
    fn choose_peer(&self, candidates: &[Arc<Peer>]) -> Option<Arc<Peer>>;
}

/// Uniform random selection over eligible peers.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl Balancer for RandomBalancer {
    fn choose_peer(&self, candidates: &[Arc<Peer>]) -> Option<Arc<Peer>> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Cycles through eligible peers in registration order, starting from the
/// earliest-registered peer.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
}

impl Balancer for RoundRobinBalancer {
    fn choose_peer(&self, candidates: &[Arc<Peer>]) -> Option<Arc<Peer>> {
        if candidates.is_empty() {
            return None;
        }
        let mut ordered: Vec<&Arc<Peer>> = candidates.iter().collect();
        ordered.sort_by_key(|peer| peer.seq());
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % ordered.len();
        Some(Arc::clone(ordered[index]))
    }
}

type BalancerFactory = Box<dyn Fn() -> Arc<dyn Balancer> + Send + Sync>;

/// Named balancer constructors.
pub struct BalancerRegistry {
    factories: HashMap<String, BalancerFactory>,
}

impl BalancerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registry preloaded with the built-in strategies: `"random"` (the
    /// default) and `"round-robin"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("random", || Arc::new(RandomBalancer));
        registry.register("round-robin", || Arc::new(RoundRobinBalancer::default()));
        registry
    }

    /// Registers a constructor under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Balancer> + Send + Sync + 'static,
    {
        debug!(name, "registered balancer");
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiates the balancer registered under `name`.
    pub fn make(&self, name: &str) -> Result<Arc<dyn Balancer>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(ProxyError::UnknownBalancer { name: name.to_string() }),
        }
    }
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
