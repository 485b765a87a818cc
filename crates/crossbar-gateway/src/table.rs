//! Service table and membership intake.
//!
//! The gateway learns the cluster through membership events: `consume`
//! announces that a node serves an app, `cleanup` retracts it. The first
//! sight of a service name creates its [`Proxy`]; later announcements only
//! register more peers into the existing pool. A proxy that loses all its
//! peers stays in the table and keeps queueing work, because the node may
//! come back; it is removed only by an explicit cleanup once empty.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crossbar_protocol::ProtocolGraph;
use crossbar_proxy::{BalancerRegistry, Connector, Pool, PoolConfig, Proxy};

use crate::error::{GatewayError, Result};

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Pool configuration applied to every service.
    pub pool: PoolConfig,
    /// Balancer strategy name, resolved through the registry.
    /// Default: `"random"`.
    pub balancer: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { pool: PoolConfig::default(), balancer: "random".to_string() }
    }
}

/// What `resolve` hands back for a known service.
#[derive(Clone)]
pub struct ServiceDescription {
    /// Service name.
    pub name: String,
    /// Protocol version announced at first sight.
    pub version: u64,
    /// The service's protocol graph.
    pub protocol: Arc<ProtocolGraph>,
}

impl std::fmt::Debug for ServiceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescription")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Default)]
struct PeerRecord {
    endpoints: Vec<SocketAddr>,
    local: bool,
    services: BTreeSet<String>,
}

/// All services known to this gateway.
pub struct GatewayTable {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    registry: BalancerRegistry,
    services: DashMap<String, Arc<Proxy>>,
    peers: Mutex<HashMap<Uuid, PeerRecord>>,
}

impl GatewayTable {
    /// Creates an empty table using the built-in balancer registry.
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_registry(config, connector, BalancerRegistry::with_defaults())
    }

    /// Creates an empty table with a caller-supplied balancer registry.
    pub fn with_registry(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        registry: BalancerRegistry,
    ) -> Self {
        Self {
            config,
            connector,
            registry,
            services: DashMap::new(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Ingests one membership announcement: node `uuid` serves `name` at
    /// `endpoints`. Creates the proxy on first sight of the service name and
    /// registers the peer into its pool either way.
    pub fn consume(
        &self,
        uuid: Uuid,
        name: &str,
        version: u64,
        endpoints: Vec<SocketAddr>,
        protocol: Arc<ProtocolGraph>,
        local: bool,
    ) -> Result<()> {
        let proxy = match self.services.get(name) {
            Some(existing) => Arc::clone(&existing),
            None => {
                let balancer = self.registry.make(&self.config.balancer)?;
                let pool = Pool::new(
                    name,
                    self.config.pool.clone(),
                    balancer,
                    Arc::clone(&self.connector),
                );
                let proxy = Arc::new(Proxy::new(name, version, protocol, pool));
                info!(name, version, "created service proxy");
                self.services
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::clone(&proxy))
                    .clone()
            }
        };
        proxy.pool().register_real(uuid, endpoints.clone(), local);

        let mut peers = self.peers.lock().unwrap();
        let record = peers.entry(uuid).or_default();
        record.endpoints = endpoints;
        record.local = local;
        record.services.insert(name.to_string());
        debug!(%uuid, name, "consumed membership event");
        Ok(())
    }

    /// Resolves a service name for a caller about to dispatch.
    pub fn resolve(&self, name: &str) -> Result<ServiceDescription> {
        match self.services.get(name) {
            Some(proxy) => Ok(ServiceDescription {
                name: proxy.name().to_string(),
                version: proxy.version(),
                protocol: Arc::clone(proxy.protocol()),
            }),
            None => Err(GatewayError::ServiceNotFound { name: name.to_string() }),
        }
    }

    /// The proxy serving `name`.
    pub fn proxy(&self, name: &str) -> Result<Arc<Proxy>> {
        match self.services.get(name) {
            Some(proxy) => Ok(Arc::clone(&proxy)),
            None => Err(GatewayError::ServiceNotFound { name: name.to_string() }),
        }
    }

    /// Number of peers serving `name`; zero for unknown services.
    pub fn total_count(&self, name: &str) -> usize {
        self.services.get(name).map(|proxy| proxy.peer_count()).unwrap_or(0)
    }

    /// Retracts one peer from one service. A cleanup addressed to a service
    /// that is already empty removes the service from the table.
    pub fn cleanup(&self, uuid: Uuid, name: &str) -> Result<()> {
        let proxy = self.proxy(name)?;
        let removed = proxy.pool().deregister_real(uuid);
        self.forget_peer_service(uuid, name);
        if removed {
            return Ok(());
        }
        if proxy.is_empty() {
            drop(proxy);
            self.services.remove(name);
            info!(name, "dropped empty service proxy");
            return Ok(());
        }
        Err(GatewayError::UnknownPeer { uuid })
    }

    /// Retracts a node from every service it was announced for; used when
    /// the node leaves the cluster.
    pub fn cleanup_uuid(&self, uuid: Uuid) -> Result<()> {
        let record = self.peers.lock().unwrap().remove(&uuid);
        let Some(record) = record else {
            return Err(GatewayError::UnknownPeer { uuid });
        };
        for name in record.services {
            if let Some(proxy) = self.services.get(&name) {
                proxy.pool().deregister_real(uuid);
            }
        }
        info!(%uuid, "node left; deregistered everywhere");
        Ok(())
    }

    /// Names of all known services.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) fn service(&self, name: &str) -> Option<Arc<Proxy>> {
        self.services.get(name).map(|proxy| Arc::clone(&proxy))
    }

    pub(crate) fn peer_records(
        &self,
    ) -> Vec<(Uuid, Vec<SocketAddr>, bool, Vec<String>)> {
        let peers = self.peers.lock().unwrap();
        let mut records: Vec<_> = peers
            .iter()
            .map(|(uuid, record)| {
                (
                    *uuid,
                    record.endpoints.clone(),
                    record.local,
                    record.services.iter().cloned().collect(),
                )
            })
            .collect();
        records.sort_by_key(|(uuid, ..)| *uuid);
        records
    }

    fn forget_peer_service(&self, uuid: Uuid, name: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(record) = peers.get_mut(&uuid) {
            record.services.remove(name);
            if record.services.is_empty() {
                peers.remove(&uuid);
            }
        }
    }
}

impl std::fmt::Debug for GatewayTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayTable")
            .field("services", &self.services.len())
            .field("peers", &self.peers.lock().unwrap().len())
            .finish()
    }
}
