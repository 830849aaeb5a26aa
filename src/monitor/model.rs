//! Cluster state model
//!
//! Everything a node publishes about itself (and replicates about its peers)
//! lives in a [`NodeSnapshot`]. The per-service monitor record ([`ServiceMonitor`])
//! is owned by the local node; peers only ever see the copy embedded in each
//! [`ServiceInstance`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Node protocol compatibility level. Peers advertising another value are
/// ignored for decisions.
pub const COMPAT_VERSION: u32 = 12;

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(crate::Error::Other(format!(
                        "invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_enum! {
    /// Availability / overall status of an instance or of a whole service.
    pub enum Status {
        Up => "up",
        Down => "down",
        Warn => "warn",
        NotApplicable => "n/a",
        StdbyUp => "stdby up",
        StdbyDown => "stdby down",
        Undef => "undef",
        Unknown => "unknown",
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

impl Status {
    pub fn is_up(&self) -> bool {
        matches!(self, Status::Up)
    }

    /// Instances in these states do not run the service.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Status::Down | Status::StdbyUp | Status::StdbyDown | Status::NotApplicable
        )
    }
}

string_enum! {
    /// Service monitor state machine.
    pub enum MonitorStatus {
        Idle => "idle",
        Ready => "ready",
        WaitParents => "wait parents",
        WaitChildren => "wait children",
        WaitSync => "wait sync",
        WaitLeader => "wait leader",
        WaitNonLeader => "wait non-leader",
        Starting => "starting",
        StartFailed => "start failed",
        Stopping => "stopping",
        StopFailed => "stop failed",
        Shutting => "shutting",
        ShutdownFailed => "shutdown failed",
        Freezing => "freezing",
        FreezeFailed => "freeze failed",
        Thawing => "thawing",
        ThawFailed => "thaw failed",
        Provisioning => "provisioning",
        ProvisionFailed => "provision failed",
        Unprovisioning => "unprovisioning",
        UnprovisionFailed => "unprovision failed",
        Deleting => "deleting",
        DeleteFailed => "delete failed",
        Restarting => "restarting",
        RestartFailed => "restart failed",
        Tocing => "tocing",
        TocFailed => "toc failed",
        Scaling => "scaling",
    }
}

impl Default for MonitorStatus {
    fn default() -> Self {
        MonitorStatus::Idle
    }
}

impl MonitorStatus {
    /// `<verb> failed` states. Terminal until cleared by an operator intent.
    pub fn is_failed(&self) -> bool {
        self.as_str().ends_with(" failed")
    }

    /// An action is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            MonitorStatus::Starting
                | MonitorStatus::Stopping
                | MonitorStatus::Shutting
                | MonitorStatus::Freezing
                | MonitorStatus::Thawing
                | MonitorStatus::Provisioning
                | MonitorStatus::Unprovisioning
                | MonitorStatus::Deleting
                | MonitorStatus::Restarting
                | MonitorStatus::Tocing
                | MonitorStatus::Scaling
        )
    }

    pub fn is_waiting(&self) -> bool {
        self.as_str().starts_with("wait ")
    }
}

string_enum! {
    pub enum NodeStatus {
        Init => "init",
        Rejoin => "rejoin",
        Idle => "idle",
        Shutting => "shutting",
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus::Init
    }
}

string_enum! {
    pub enum NodeGlobalExpect {
        Frozen => "frozen",
        Thawed => "thawed",
    }
}

string_enum! {
    pub enum LocalExpect {
        Started => "started",
        Shutdown => "shutdown",
    }
}

string_enum! {
    /// Placement role of the local instance, recomputed every pass.
    pub enum Placement {
        Leader => "leader",
        NonLeader => "non-leader",
        None => "none",
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::None
    }
}

string_enum! {
    pub enum Topology {
        Failover => "failover",
        Flex => "flex",
        Span => "span",
    }
}

impl Default for Topology {
    fn default() -> Self {
        Topology::Failover
    }
}

string_enum! {
    pub enum FrozenState {
        Frozen => "frozen",
        Thawed => "thawed",
        Mixed => "mixed",
        NotApplicable => "n/a",
    }
}

string_enum! {
    pub enum PlacementQuality {
        Optimal => "optimal",
        NonOptimal => "non-optimal",
        NotApplicable => "n/a",
    }
}

string_enum! {
    pub enum Provisioned {
        True => "true",
        False => "false",
        Mixed => "mixed",
        NotApplicable => "n/a",
    }
}

impl Provisioned {
    /// Fold a set of per-item states: all true, all false, mixed, or no data.
    pub fn fold<I: IntoIterator<Item = Provisioned>>(states: I) -> Provisioned {
        let mut seen_true = false;
        let mut seen_false = false;
        for state in states {
            match state {
                Provisioned::True => seen_true = true,
                Provisioned::False => seen_false = true,
                Provisioned::Mixed => {
                    seen_true = true;
                    seen_false = true;
                }
                Provisioned::NotApplicable => {}
            }
        }
        match (seen_true, seen_false) {
            (true, false) => Provisioned::True,
            (false, true) => Provisioned::False,
            (true, true) => Provisioned::Mixed,
            (false, false) => Provisioned::NotApplicable,
        }
    }
}

/// Cluster-wide declared target of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GlobalExpect {
    Frozen,
    Thawed,
    Started,
    Stopped,
    Shutdown,
    Provisioned,
    Unprovisioned,
    Deleted,
    Purged,
    Placed,
    /// Relocate to an explicit ordered list of nodes
    PlacedAt(Vec<String>),
    Aborted,
}

impl fmt::Display for GlobalExpect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GlobalExpect::Frozen => "frozen",
            GlobalExpect::Thawed => "thawed",
            GlobalExpect::Started => "started",
            GlobalExpect::Stopped => "stopped",
            GlobalExpect::Shutdown => "shutdown",
            GlobalExpect::Provisioned => "provisioned",
            GlobalExpect::Unprovisioned => "unprovisioned",
            GlobalExpect::Deleted => "deleted",
            GlobalExpect::Purged => "purged",
            GlobalExpect::Placed => "placed",
            GlobalExpect::Aborted => "aborted",
            GlobalExpect::PlacedAt(nodes) => return write!(f, "placed@{}", nodes.join(",")),
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for GlobalExpect {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "frozen" => GlobalExpect::Frozen,
            "thawed" => GlobalExpect::Thawed,
            "started" => GlobalExpect::Started,
            "stopped" => GlobalExpect::Stopped,
            "shutdown" => GlobalExpect::Shutdown,
            "provisioned" => GlobalExpect::Provisioned,
            "unprovisioned" => GlobalExpect::Unprovisioned,
            "deleted" => GlobalExpect::Deleted,
            "purged" => GlobalExpect::Purged,
            "placed" => GlobalExpect::Placed,
            "aborted" => GlobalExpect::Aborted,
            other => match other.strip_prefix("placed@") {
                Some(nodes) if !nodes.is_empty() => GlobalExpect::PlacedAt(
                    nodes
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(String::from)
                        .collect(),
                ),
                _ => {
                    return Err(crate::Error::Other(format!(
                        "invalid global expect: {}",
                        other
                    )))
                }
            },
        })
    }
}

impl Serialize for GlobalExpect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GlobalExpect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// SMON: the local node's monitor record for one service path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMonitor {
    pub status: MonitorStatus,
    pub status_updated: f64,
    pub global_expect: Option<GlobalExpect>,
    pub global_expect_updated: f64,
    pub local_expect: Option<LocalExpect>,
    pub placement: Placement,
    pub stonith: Option<String>,
    /// Restarts already attempted, per resource id
    pub restart: BTreeMap<String, u32>,
}

impl ServiceMonitor {
    pub fn is_leader(&self) -> bool {
        self.placement == Placement::Leader
    }
}

/// NMON: one per node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMonitor {
    pub status: NodeStatus,
    pub status_updated: f64,
    pub global_expect: Option<NodeGlobalExpect>,
    pub global_expect_updated: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceStatus {
    pub status: Status,
    /// Monitored resources trigger a toc once restarts are exhausted
    pub monitor: bool,
    /// Configured restart limit
    pub restart: u32,
    /// `None` when the resource has no provisioning notion
    pub provisioned: Option<bool>,
}

/// A containerized sub-service running inside an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncapInstance {
    pub avail: Status,
    pub overall: Status,
    pub frozen: f64,
}

/// A node's view of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstance {
    pub avail: Status,
    pub overall: Status,
    /// Freeze timestamp, 0 when thawed
    pub frozen: f64,
    pub topology: Topology,
    pub resources: BTreeMap<String, ResourceStatus>,
    pub encap: BTreeMap<String, EncapInstance>,
    /// Scaler target, only set on scaler services
    pub scale: Option<u32>,
    pub scaler_slave: bool,
    pub flex_min: u32,
    pub flex_max: u32,
    pub flex_target: u32,
    /// Copy of the owning node's SMON for this path
    pub monitor: ServiceMonitor,
    pub updated: f64,
}

impl Default for ServiceInstance {
    fn default() -> Self {
        Self {
            avail: Status::NotApplicable,
            overall: Status::NotApplicable,
            frozen: 0.0,
            topology: Topology::Failover,
            resources: BTreeMap::new(),
            encap: BTreeMap::new(),
            scale: None,
            scaler_slave: false,
            flex_min: 1,
            flex_max: 1,
            flex_target: 1,
            monitor: ServiceMonitor::default(),
            updated: 0.0,
        }
    }
}

impl ServiceInstance {
    pub fn is_frozen(&self) -> bool {
        self.frozen > 0.0
    }

    /// Provisioned state folded over the instance resources.
    pub fn provisioned(&self) -> Provisioned {
        Provisioned::fold(self.resources.values().map(|r| match r.provisioned {
            Some(true) => Provisioned::True,
            Some(false) => Provisioned::False,
            None => Provisioned::NotApplicable,
        }))
    }

    /// Instances without resource provisioning data count as provisioned.
    pub fn is_provisioned(&self) -> bool {
        matches!(
            self.provisioned(),
            Provisioned::True | Provisioned::NotApplicable
        )
    }

    /// Instances with no resource left provisioned
    pub fn is_unprovisioned(&self) -> bool {
        matches!(
            self.provisioned(),
            Provisioned::False | Provisioned::NotApplicable
        )
    }
}

/// Per-service config reference advertised by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigRef {
    pub csum: String,
    pub updated: f64,
    /// Nodes the config declares
    pub scope: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitratorVote {
    pub name: String,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStats {
    pub load_15m: f64,
    pub mem_avail_pct: f64,
    pub swap_avail_pct: f64,
    pub score: u32,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            load_15m: 0.0,
            mem_avail_pct: 100.0,
            swap_avail_pct: 100.0,
            score: 0,
        }
    }
}

/// Everything one node publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSnapshot {
    pub agent: String,
    pub compat: u32,
    pub monitor: NodeMonitor,
    /// Node freeze timestamp, 0 when thawed
    pub frozen: f64,
    pub config: BTreeMap<String, ServiceConfigRef>,
    pub services: BTreeMap<String, ServiceInstance>,
    /// Daemon start counter. Generations restart from 1 on each boot.
    pub boot: u64,
    pub generation: u64,
    pub updated: f64,
    pub arbitrators: BTreeMap<String, ArbitratorVote>,
    pub stats: NodeStats,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        Self {
            agent: crate::VERSION.to_string(),
            compat: COMPAT_VERSION,
            monitor: NodeMonitor::default(),
            frozen: 0.0,
            config: BTreeMap::new(),
            services: BTreeMap::new(),
            boot: 0,
            generation: 0,
            updated: 0.0,
            arbitrators: BTreeMap::new(),
            stats: NodeStats::default(),
        }
    }
}

impl NodeSnapshot {
    pub fn is_frozen(&self) -> bool {
        self.frozen > 0.0
    }

    pub fn instance(&self, path: &str) -> Option<&ServiceInstance> {
        self.services.get(path)
    }
}

/// Cluster-wide derived status of one service. Recomputed every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedServiceStatus {
    pub avail: Status,
    pub overall: Status,
    pub frozen: FrozenState,
    pub placement: PlacementQuality,
    pub provisioned: Provisioned,
}

impl Default for AggregatedServiceStatus {
    fn default() -> Self {
        Self {
            avail: Status::NotApplicable,
            overall: Status::NotApplicable,
            frozen: FrozenState::NotApplicable,
            placement: PlacementQuality::NotApplicable,
            provisioned: Provisioned::NotApplicable,
        }
    }
}

/// Result of a policy step.
#[derive(Debug)]
pub enum Outcome {
    Continue,
    Abort(String),
    Fail(crate::Error),
}

impl Outcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, Outcome::Continue)
    }
}
