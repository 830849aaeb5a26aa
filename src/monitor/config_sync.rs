//! Service config exchange between nodes
//!
//! Every node advertises a checksum per service config in its snapshot.
//! When a peer advertises a different and newer one, or a config we do not
//! have at all for a service scoped to this node, the descriptor is fetched
//! from that peer with an `object_config` request and installed locally.

use crate::common::{retry_with_backoff, Error, Result};
use crate::monitor::descriptor::ServiceRegistry;
use crate::monitor::model::GlobalExpect;
use crate::monitor::store::{ClusterView, StateStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const FETCH_RETRIES: usize = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfigRequest {
    pub action: String,
    pub path: String,
}

impl ObjectConfigRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            action: "object_config".to_string(),
            path: path.into(),
        }
    }
}

/// `status` is 0 on success; `data` carries the descriptor JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfigResponse {
    pub status: i32,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub mtime: f64,
}

/// Request/response channel to a peer daemon.
///
/// Transport failures should surface as [`Error::PeerUnreachable`] or
/// [`Error::Io`] so the fetch is retried.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn fetch_config(&self, node: &str, request: &ObjectConfigRequest) -> Result<ObjectConfigResponse>;
}

/// Client for daemons running without a peer transport.
#[derive(Debug, Default)]
pub struct DisabledPeerClient;

#[async_trait]
impl PeerClient for DisabledPeerClient {
    async fn fetch_config(&self, node: &str, request: &ObjectConfigRequest) -> Result<ObjectConfigResponse> {
        Err(Error::Other(format!(
            "no peer transport to fetch {} from {}",
            request.path, node
        )))
    }
}

/// Answer a peer's `object_config` request from the local registry.
pub fn serve_object_config(registry: &ServiceRegistry, request: &ObjectConfigRequest) -> ObjectConfigResponse {
    let found = registry
        .get(&request.path)
        .zip(registry.config_ref(&request.path));
    match found {
        Some((desc, cref)) => match desc.to_json() {
            Ok(data) => ObjectConfigResponse {
                status: 0,
                data: Some(data),
                mtime: cref.updated,
            },
            Err(e) => {
                warn!(path = %request.path, "serialize config: {}", e);
                ObjectConfigResponse {
                    status: 1,
                    data: None,
                    mtime: 0.0,
                }
            }
        },
        None => ObjectConfigResponse {
            status: 1,
            data: None,
            mtime: 0.0,
        },
    }
}

/// Is `path` being deleted somewhere? Its config must not come back.
fn departing(view: &ClusterView, path: &str) -> bool {
    view.instances(path).values().any(|i| {
        matches!(
            i.monitor.global_expect,
            Some(GlobalExpect::Deleted | GlobalExpect::Purged)
        )
    })
}

/// Paths whose config should be fetched, each with the peer advertising
/// the newest version.
pub fn stale_configs(registry: &ServiceRegistry, view: &ClusterView) -> BTreeMap<String, String> {
    let mut best: BTreeMap<String, (String, f64)> = BTreeMap::new();
    for (node, snap) in view.peers() {
        for (path, remote) in &snap.config {
            if departing(view, path) {
                continue;
            }
            let wanted = match registry.config_ref(path) {
                Some(local) => local.csum != remote.csum && remote.updated > local.updated,
                None => remote.scope.iter().any(|n| *n == view.local),
            };
            if !wanted {
                continue;
            }
            let newer = best
                .get(path)
                .map_or(true, |(_, updated)| remote.updated > *updated);
            if newer {
                best.insert(path.clone(), (node.clone(), remote.updated));
            }
        }
    }
    best.into_iter().map(|(path, (node, _))| (path, node)).collect()
}

/// Fetch and install every stale config. Returns the number installed.
pub async fn sync_configs(
    client: &dyn PeerClient,
    registry: &ServiceRegistry,
    store: &StateStore,
    stale: BTreeMap<String, String>,
) -> usize {
    let mut installed = 0;
    for (path, node) in stale {
        let request = ObjectConfigRequest::new(&path);
        let response = retry_with_backoff(
            || client.fetch_config(&node, &request),
            FETCH_RETRIES,
            FETCH_BACKOFF,
        )
        .await;
        match response {
            Ok(ObjectConfigResponse {
                status: 0,
                data: Some(data),
                mtime,
            }) => match registry.install(&path, data, mtime) {
                Ok(_) => {
                    info!(path = %path, node = %node, "installed config from peer");
                    installed += 1;
                }
                Err(e) => warn!(path = %path, node = %node, "install peer config: {}", e),
            },
            Ok(response) => {
                debug!(path = %path, node = %node, status = response.status, "peer has no config");
            }
            Err(e) => warn!(path = %path, node = %node, "fetch config: {}", e),
        }
    }
    if installed > 0 {
        store.set_local_config(registry.config_refs());
        store.notify_changed();
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::descriptor::ServiceDescriptor;
    use crate::monitor::model::{NodeSnapshot, ServiceInstance, Topology};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Serves configs out of per-node registries.
    #[derive(Default)]
    struct LocalPeers {
        registries: HashMap<String, Arc<ServiceRegistry>>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerClient for LocalPeers {
        async fn fetch_config(&self, node: &str, request: &ObjectConfigRequest) -> Result<ObjectConfigResponse> {
            self.requests.lock().push(format!("{} {}", node, request.path));
            let registry = self
                .registries
                .get(node)
                .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
            Ok(serve_object_config(registry, request))
        }
    }

    fn desc(path: &str, nodes: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor::new(
            path,
            Topology::Failover,
            nodes.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn advertise(store: &StateStore, node: &str, registry: &ServiceRegistry) {
        store.put_peer(
            node,
            NodeSnapshot {
                config: registry.config_refs(),
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_stale_configs() {
        let local = ServiceRegistry::new();
        local.insert(desc("ns/svc/a", &["n1", "n2"]), 10.0).unwrap();
        local.insert(desc("ns/svc/b", &["n1", "n2"]), 10.0).unwrap();

        let remote = ServiceRegistry::new();
        // newer and different
        let mut a = desc("ns/svc/a", &["n1", "n2"]);
        a.parents = vec!["ns/svc/b".into()];
        remote.insert(a, 20.0).unwrap();
        // different but older
        let mut b = desc("ns/svc/b", &["n1", "n2"]);
        b.stonith = true;
        remote.insert(b, 5.0).unwrap();
        // unknown here and scoped to us
        remote.insert(desc("ns/svc/c", &["n1"]), 1.0).unwrap();
        // unknown here, not for us
        remote.insert(desc("ns/svc/d", &["n2"]), 1.0).unwrap();

        let store = StateStore::new("n1");
        advertise(&store, "n2", &remote);
        let stale = stale_configs(&local, &store.cluster_view());
        assert_eq!(
            stale.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["ns/svc/a", "ns/svc/c"]
        );
        assert_eq!(stale["ns/svc/a"], "n2");
    }

    #[test]
    fn test_purged_config_not_fetched_back() {
        let remote = ServiceRegistry::new();
        remote.insert(desc("ns/svc/a", &["n1", "n2"]), 1.0).unwrap();
        let store = StateStore::new("n1");
        let mut instance = ServiceInstance::default();
        instance.monitor.global_expect = Some(GlobalExpect::Purged);
        store.put_peer(
            "n2",
            NodeSnapshot {
                config: remote.config_refs(),
                services: [("ns/svc/a".to_string(), instance)].into(),
                ..Default::default()
            },
        );
        assert!(stale_configs(&ServiceRegistry::new(), &store.cluster_view()).is_empty());
    }

    #[test]
    fn test_serve_unknown_path() {
        let registry = ServiceRegistry::new();
        let response = serve_object_config(&registry, &ObjectConfigRequest::new("ns/svc/x"));
        assert_eq!(response.status, 1);
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn test_sync_installs_peer_config() {
        let remote = Arc::new(ServiceRegistry::new());
        remote.insert(desc("ns/svc/c", &["n1", "n2"]), 42.0).unwrap();
        let client = LocalPeers {
            registries: [("n2".to_string(), remote.clone())].into(),
            ..Default::default()
        };

        let local = ServiceRegistry::new();
        let store = StateStore::new("n1");
        advertise(&store, "n2", &remote);
        let stale = stale_configs(&local, &store.cluster_view());
        let installed = sync_configs(&client, &local, &store, stale).await;

        assert_eq!(installed, 1);
        assert_eq!(*client.requests.lock(), vec!["n2 ns/svc/c".to_string()]);
        let cref = local.config_ref("ns/svc/c").unwrap();
        assert_eq!(cref.csum, remote.config_ref("ns/svc/c").unwrap().csum);
        assert_eq!(cref.updated, 42.0);
        assert!(store.local_snapshot().config.contains_key("ns/svc/c"));

        // now in sync
        assert!(stale_configs(&local, &store.cluster_view()).is_empty());
    }

    /// Drops the first `failures` requests.
    struct Flaky {
        inner: LocalPeers,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl PeerClient for Flaky {
        async fn fetch_config(&self, node: &str, request: &ObjectConfigRequest) -> Result<ObjectConfigResponse> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    self.inner.requests.lock().push(format!("{} {}", node, request.path));
                    return Err(Error::PeerUnreachable {
                        node: node.to_string(),
                        reason: "connection reset".into(),
                    });
                }
            }
            self.inner.fetch_config(node, request).await
        }
    }

    #[tokio::test]
    async fn test_sync_retries_unreachable_peer() {
        let remote = Arc::new(ServiceRegistry::new());
        remote.insert(desc("ns/svc/c", &["n1", "n2"]), 42.0).unwrap();
        let client = Flaky {
            inner: LocalPeers {
                registries: [("n2".to_string(), remote.clone())].into(),
                ..Default::default()
            },
            failures: Mutex::new(1),
        };

        let local = ServiceRegistry::new();
        let store = StateStore::new("n1");
        advertise(&store, "n2", &remote);
        let stale = stale_configs(&local, &store.cluster_view());
        assert_eq!(sync_configs(&client, &local, &store, stale).await, 1);
        assert_eq!(client.inner.requests.lock().len(), 2);
        assert!(local.contains("ns/svc/c"));
    }

    #[tokio::test]
    async fn test_disabled_transport_is_not_retried() {
        let remote = ServiceRegistry::new();
        remote.insert(desc("ns/svc/c", &["n1", "n2"]), 42.0).unwrap();
        let local = ServiceRegistry::new();
        let store = StateStore::new("n1");
        advertise(&store, "n2", &remote);
        let stale = stale_configs(&local, &store.cluster_view());
        let started = std::time::Instant::now();
        assert_eq!(sync_configs(&DisabledPeerClient, &local, &store, stale).await, 0);
        assert!(started.elapsed() < FETCH_BACKOFF);
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(ObjectConfigRequest::new("ns/svc/a")).unwrap();
        assert_eq!(json, serde_json::json!({"action": "object_config", "path": "ns/svc/a"}));
    }
}
