//! Service descriptors and the local registry
//!
//! A [`ServiceDescriptor`] is assembled once from a parsed service config and
//! handed explicitly to every orchestrator function that needs it.

use crate::common::{blake3_hash, Error, Result};
use crate::monitor::model::{ServiceConfigRef, Topology};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrateMode {
    /// Only explicit intents move the service
    #[default]
    No,
    /// Automatic start, no resource monitoring
    Start,
    /// Automatic start and failover, resource restarts and toc
    Ha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementPolicy {
    #[default]
    #[serde(rename = "nodes order")]
    NodesOrder,
    #[serde(rename = "load avg")]
    LoadAvg,
    #[serde(rename = "score")]
    Score,
    #[serde(rename = "spread")]
    Spread,
    #[serde(rename = "none")]
    None,
}

fn default_flex_min() -> u32 {
    1
}

/// Static description of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// `<namespace>/<kind>/<name>`
    pub path: String,
    #[serde(default)]
    pub topology: Topology,
    /// Nodes allowed to run the service, in declared order
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub orchestrate: OrchestrateMode,
    #[serde(default)]
    pub placement: PlacementPolicy,
    #[serde(default = "default_flex_min")]
    pub flex_min: u32,
    #[serde(default)]
    pub flex_max: Option<u32>,
    #[serde(default)]
    pub flex_target: Option<u32>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
    /// Sub-services whose status folds into this one
    #[serde(default)]
    pub slaves: Vec<String>,
    /// Scaler target, in slots
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub scaler_slave: bool,
    #[serde(default)]
    pub hard_affinity: Vec<String>,
    #[serde(default)]
    pub hard_anti_affinity: Vec<String>,
    #[serde(default)]
    pub soft_affinity: Vec<String>,
    #[serde(default)]
    pub soft_anti_affinity: Vec<String>,
    /// Fence a departed peer before taking over
    #[serde(default)]
    pub stonith: bool,
}

impl ServiceDescriptor {
    pub fn new(path: impl Into<String>, topology: Topology, nodes: Vec<String>) -> Self {
        Self {
            path: path.into(),
            topology,
            nodes,
            orchestrate: OrchestrateMode::Ha,
            placement: PlacementPolicy::NodesOrder,
            flex_min: 1,
            flex_max: None,
            flex_target: None,
            parents: Vec::new(),
            children: Vec::new(),
            slaves: Vec::new(),
            scale: None,
            scaler_slave: false,
            hard_affinity: Vec::new(),
            hard_anti_affinity: Vec::new(),
            soft_affinity: Vec::new(),
            soft_anti_affinity: Vec::new(),
            stonith: false,
        }
    }

    pub fn flex_max(&self) -> u32 {
        match self.topology {
            Topology::Failover => 1,
            Topology::Span => self.nodes.len() as u32,
            Topology::Flex => self.flex_max.unwrap_or(self.nodes.len() as u32),
        }
    }

    pub fn flex_min(&self) -> u32 {
        match self.topology {
            Topology::Failover => 1,
            Topology::Span => self.nodes.len() as u32,
            Topology::Flex => self.flex_min.min(self.flex_max()),
        }
    }

    /// Number of instances the service wants up
    pub fn flex_target(&self) -> u32 {
        match self.topology {
            Topology::Failover => 1,
            Topology::Span => self.nodes.len() as u32,
            Topology::Flex => self
                .flex_target
                .unwrap_or(self.flex_min)
                .clamp(self.flex_min(), self.flex_max().max(self.flex_min())),
        }
    }

    pub fn is_scaler(&self) -> bool {
        self.scale.is_some()
    }

    /// Slots a slave of this service contributes to its scaler
    pub fn slots(&self) -> u32 {
        match self.topology {
            Topology::Failover => 1,
            _ => self.flex_target(),
        }
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path prefix shared by the service and its scaler slaves
    fn parent_dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(pos) => &self.path[..=pos],
            None => "",
        }
    }

    /// Path of the `index`-th scaler slave, e.g. `ns/svc/3.web`
    pub fn slave_path(&self, index: u32) -> String {
        format!("{}{}.{}", self.parent_dir(), index, self.name())
    }

    /// Index of `path` if it names a scaler slave of this service
    pub fn slave_index(&self, path: &str) -> Option<u32> {
        let rest = path.strip_prefix(self.parent_dir())?;
        let (index, name) = rest.split_once('.')?;
        if name != self.name() {
            return None;
        }
        index.parse().ok()
    }

    /// Descriptor of a new scaler slave carrying `width` instances
    pub fn slave_descriptor(&self, index: u32, width: u32) -> ServiceDescriptor {
        let mut slave = self.clone();
        slave.path = self.slave_path(index);
        slave.scale = None;
        slave.scaler_slave = true;
        slave.slaves.clear();
        if self.topology != Topology::Failover {
            slave.flex_min = width;
            slave.flex_max = Some(width);
            slave.flex_target = Some(width);
        }
        slave
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Content checksum advertised to peers
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3_hash(&bytes))
    }

    pub fn config_ref(&self, updated: f64) -> Result<ServiceConfigRef> {
        Ok(ServiceConfigRef {
            csum: self.checksum()?,
            updated,
            scope: self.nodes.clone(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.split('/').count() != 3 || self.path.split('/').any(str::is_empty) {
            return Err(Error::InvalidConfig(format!(
                "service path must be <namespace>/<kind>/<name>: {}",
                self.path
            )));
        }
        if self.topology == Topology::Flex && self.flex_min > self.flex_max() {
            return Err(Error::InvalidConfig(format!(
                "{}: flex_min {} > flex_max {}",
                self.path,
                self.flex_min,
                self.flex_max()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    descriptor: Arc<ServiceDescriptor>,
    config_ref: ServiceConfigRef,
}

/// Descriptors of every service known on this node.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a descriptor, stamped with its config mtime.
    pub fn insert(&self, descriptor: ServiceDescriptor, updated: f64) -> Result<Arc<ServiceDescriptor>> {
        descriptor.validate()?;
        let config_ref = descriptor.config_ref(updated)?;
        let descriptor = Arc::new(descriptor);
        self.entries.write().insert(
            descriptor.path.clone(),
            RegistryEntry {
                descriptor: descriptor.clone(),
                config_ref,
            },
        );
        Ok(descriptor)
    }

    /// Install a descriptor received as JSON from a peer.
    pub fn install(&self, path: &str, data: serde_json::Value, updated: f64) -> Result<Arc<ServiceDescriptor>> {
        let descriptor: ServiceDescriptor = serde_json::from_value(data)?;
        if descriptor.path != path {
            return Err(Error::InvalidConfig(format!(
                "peer sent config for {} while {} was requested",
                descriptor.path, path
            )));
        }
        self.insert(descriptor, updated)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<ServiceDescriptor>> {
        self.entries.write().remove(path).map(|e| e.descriptor)
    }

    pub fn get(&self, path: &str) -> Option<Arc<ServiceDescriptor>> {
        self.entries.read().get(path).map(|e| e.descriptor.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.read().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.entries
            .read()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn config_ref(&self, path: &str) -> Option<ServiceConfigRef> {
        self.entries.read().get(path).map(|e| e.config_ref.clone())
    }

    pub fn config_refs(&self) -> BTreeMap<String, ServiceConfigRef> {
        self.entries
            .read()
            .iter()
            .map(|(path, e)| (path.clone(), e.config_ref.clone()))
            .collect()
    }

    /// Registered scaler slaves of `scaler`, ordered by index
    pub fn scaler_slaves(&self, scaler: &ServiceDescriptor) -> Vec<(u32, Arc<ServiceDescriptor>)> {
        let mut slaves: Vec<_> = self
            .entries
            .read()
            .values()
            .filter_map(|e| {
                scaler
                    .slave_index(&e.descriptor.path)
                    .map(|i| (i, e.descriptor.clone()))
            })
            .collect();
        slaves.sort_by_key(|(i, _)| *i);
        slaves
    }

    /// Load every `*.json` descriptor from `dir`. Unparsable files are
    /// logged and skipped.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.exists() {
            tracing::warn!("services directory {} does not exist", dir.display());
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let updated = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let parsed = std::fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<ServiceDescriptor>(&bytes)?));
            match parsed.and_then(|d| self.insert(d, updated)) {
                Ok(descriptor) => {
                    tracing::debug!(path = %descriptor.path, "loaded service descriptor");
                    loaded += 1;
                }
                Err(e) => tracing::warn!("skip {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flex_bounds() {
        let mut svc = ServiceDescriptor::new("ns/svc/web", Topology::Flex, nodes(&["a", "b", "c"]));
        svc.flex_min = 2;
        assert_eq!(svc.flex_max(), 3);
        assert_eq!(svc.flex_target(), 2);
        svc.flex_target = Some(10);
        assert_eq!(svc.flex_target(), 3);

        let failover = ServiceDescriptor::new("ns/svc/db", Topology::Failover, nodes(&["a", "b"]));
        assert_eq!(failover.flex_target(), 1);
    }

    #[test]
    fn test_slave_paths() {
        let scaler = ServiceDescriptor::new("ns/svc/web", Topology::Flex, nodes(&["a", "b"]));
        assert_eq!(scaler.slave_path(3), "ns/svc/3.web");
        assert_eq!(scaler.slave_index("ns/svc/3.web"), Some(3));
        assert_eq!(scaler.slave_index("ns/svc/3.db"), None);
        assert_eq!(scaler.slave_index("other/svc/3.web"), None);

        let slave = scaler.slave_descriptor(0, 2);
        assert!(slave.scaler_slave);
        assert_eq!(slave.slots(), 2);
    }

    #[test]
    fn test_registry_checksum_changes_with_content() {
        let registry = ServiceRegistry::new();
        let mut svc = ServiceDescriptor::new("ns/svc/web", Topology::Failover, nodes(&["a", "b"]));
        registry.insert(svc.clone(), 10.0).unwrap();
        let before = registry.config_ref("ns/svc/web").unwrap();

        svc.nodes.push("c".into());
        registry.insert(svc, 11.0).unwrap();
        let after = registry.config_ref("ns/svc/web").unwrap();

        assert_ne!(before.csum, after.csum);
        assert_eq!(after.scope.len(), 3);
    }

    #[test]
    fn test_registry_rejects_bad_path() {
        let registry = ServiceRegistry::new();
        let svc = ServiceDescriptor::new("web", Topology::Failover, nodes(&["a"]));
        assert!(registry.insert(svc, 0.0).is_err());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("web.json"),
            r#"{"path": "ns/svc/web", "topology": "flex", "nodes": ["a", "b"], "orchestrate": "ha", "placement": "load avg"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = ServiceRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 1);
        let web = registry.get("ns/svc/web").unwrap();
        assert_eq!(web.placement, PlacementPolicy::LoadAvg);
        assert_eq!(web.orchestrate, OrchestrateMode::Ha);
    }
}
