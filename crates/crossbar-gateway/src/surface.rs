//! Observation surface: `info`, `peers` and `apps`.
//!
//! These build the structured values an operator endpoint serializes as-is.
//! Everything is computed from live pool state at call time; there is no
//! cached view to go stale.

use serde_json::{json, Map, Value};

use crate::table::GatewayTable;

impl GatewayTable {
    /// Summary of the whole gateway: every service and every known peer.
    pub fn info(&self) -> Value {
        json!({
            "balancer": self.config().balancer,
            "apps": self.apps(None),
            "peers": self.peers(None),
        })
    }

    /// Per-node view. `filter` restricts the output to nodes serving one
    /// service name.
    pub fn peers(&self, filter: Option<&str>) -> Value {
        let mut out = Map::new();
        for (uuid, endpoints, local, services) in self.peer_records() {
            if matches!(filter, Some(wanted) if !services.iter().any(|s| s == wanted)) {
                continue;
            }
            let key = uuid.to_string();
            let connected = services.iter().any(|name| {
                self.service(name)
                    .and_then(|proxy| proxy.pool().peer(uuid))
                    .is_some_and(|peer| peer.connected())
            });
            out.insert(
                key,
                json!({
                    "endpoints": endpoints,
                    "local": local,
                    "connected": connected,
                    "services": services,
                }),
            );
        }
        Value::Object(out)
    }

    /// Per-service view. `filter` restricts the output to one service name.
    pub fn apps(&self, filter: Option<&str>) -> Value {
        let mut out = Map::new();
        for name in self.service_names() {
            if matches!(filter, Some(wanted) if wanted != name) {
                continue;
            }
            let Some(proxy) = self.service(&name) else { continue };
            let stats = proxy.stats();
            let access = proxy.access_stats();
            out.insert(
                name,
                json!({
                    "version": proxy.version(),
                    "peers": stats.peers,
                    "connected": stats.connected,
                    "frozen": stats.frozen,
                    "queued": stats.queued,
                    "invocations": {
                        "total": access.total,
                        "failed": access.failed,
                        "retried": access.retried,
                    },
                }),
            );
        }
        Value::Object(out)
    }
}
