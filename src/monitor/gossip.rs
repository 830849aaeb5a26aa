//! Gossip diff/merge protocol
//!
//! Each node publishes its snapshot as a stream of structural patches
//! (`[[path...], value]` operations, `[[path...]]` for a removal), one patch
//! per generation. Peers apply patches in order onto their replica. A patch
//! that does not extend the replica generation by exactly one is discarded
//! and the sender is flagged for a full snapshot resync.
//!
//! Generations count from 1 again after a daemon restart, so every message
//! also carries the sender's boot counter. A message from a newer boot
//! supersedes the replica whatever its generation; one from an older boot
//! is dropped.

use crate::common::{Error, Result};
use crate::monitor::model::NodeSnapshot;
use crate::monitor::store::StateStore;
use parking_lot::Mutex;
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Top-level snapshot fields that never appear in a diff.
const UNDIFFED_KEYS: [&str; 2] = ["generation", "updated"];

/// Outbound queue bound. Older patches are dropped: peers resync.
const MAX_OUTBOX: usize = 256;

/// One segment of a patch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKey {
    Key(String),
    Index(usize),
}

impl From<&str> for PathKey {
    fn from(s: &str) -> Self {
        PathKey::Key(s.to_string())
    }
}

impl From<usize> for PathKey {
    fn from(i: usize) -> Self {
        PathKey::Index(i)
    }
}

impl Serialize for PathKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PathKey::Key(k) => serializer.serialize_str(k),
            PathKey::Index(i) => serializer.serialize_u64(*i as u64),
        }
    }
}

impl<'de> Deserialize<'de> for PathKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(PathKey::Key(s)),
            Value::Number(n) => n
                .as_u64()
                .map(|i| PathKey::Index(i as usize))
                .ok_or_else(|| D::Error::custom("path index must be a positive integer")),
            other => Err(D::Error::custom(format!("invalid path segment: {}", other))),
        }
    }
}

/// Set `path` to `value`, or remove `path` when `value` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOp {
    pub path: Vec<PathKey>,
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn set(path: Vec<PathKey>, value: Value) -> Self {
        Self {
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Vec<PathKey>) -> Self {
        Self { path, value: None }
    }
}

impl Serialize for PatchOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.path)?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PatchOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut items = Vec::<Value>::deserialize(deserializer)?;
        if items.is_empty() || items.len() > 2 {
            return Err(D::Error::custom("patch op must be [path] or [path, value]"));
        }
        let value = if items.len() == 2 { items.pop() } else { None };
        let path: Vec<PathKey> = serde_json::from_value(items.remove(0)).map_err(D::Error::custom)?;
        Ok(PatchOp { path, value })
    }
}

/// What travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GossipMessage {
    Patch {
        node: String,
        #[serde(default)]
        boot: u64,
        generation: u64,
        ops: Vec<PatchOp>,
    },
    Full {
        node: String,
        #[serde(default)]
        boot: u64,
        generation: u64,
        snapshot: Value,
    },
}

impl GossipMessage {
    pub fn node(&self) -> &str {
        match self {
            GossipMessage::Patch { node, .. } | GossipMessage::Full { node, .. } => node,
        }
    }

    pub fn boot(&self) -> u64 {
        match self {
            GossipMessage::Patch { boot, .. } | GossipMessage::Full { boot, .. } => *boot,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            GossipMessage::Patch { generation, .. } | GossipMessage::Full { generation, .. } => {
                *generation
            }
        }
    }
}

/// Result of ingesting one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Applied,
    Replaced,
    /// Stale or out-of-sequence: dropped, peer flagged for resync if needed
    Discarded,
}

/// Structural diff of two snapshots, `generation`/`updated` excluded.
pub fn compute_diff(prev: &Value, cur: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let prev = strip_undiffed(prev);
    let cur = strip_undiffed(cur);
    diff_into(&prev, &cur, &mut Vec::new(), &mut ops);
    ops
}

fn strip_undiffed(value: &Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        for key in UNDIFFED_KEYS {
            map.remove(key);
        }
    }
    value
}

fn diff_into(prev: &Value, cur: &Value, path: &mut Vec<PathKey>, ops: &mut Vec<PatchOp>) {
    match (prev, cur) {
        (Value::Object(p), Value::Object(c)) => {
            for (key, cur_value) in c {
                path.push(PathKey::Key(key.clone()));
                match p.get(key) {
                    Some(prev_value) => diff_into(prev_value, cur_value, path, ops),
                    None => ops.push(PatchOp::set(path.clone(), cur_value.clone())),
                }
                path.pop();
            }
            for key in p.keys().filter(|k| !c.contains_key(*k)) {
                path.push(PathKey::Key(key.clone()));
                ops.push(PatchOp::remove(path.clone()));
                path.pop();
            }
        }
        (Value::Array(p), Value::Array(c)) => {
            let common = p.len().min(c.len());
            for i in 0..common {
                path.push(PathKey::Index(i));
                diff_into(&p[i], &c[i], path, ops);
                path.pop();
            }
            for (i, item) in c.iter().enumerate().skip(common) {
                path.push(PathKey::Index(i));
                ops.push(PatchOp::set(path.clone(), item.clone()));
                path.pop();
            }
            // highest index first so earlier removals do not shift later ones
            for i in (common..p.len()).rev() {
                path.push(PathKey::Index(i));
                ops.push(PatchOp::remove(path.clone()));
                path.pop();
            }
        }
        _ => {
            if prev != cur {
                ops.push(PatchOp::set(path.clone(), cur.clone()));
            }
        }
    }
}

/// Apply `ops` in order onto `target`.
pub fn apply_patch(target: &mut Value, ops: &[PatchOp]) -> Result<()> {
    for op in ops {
        apply_op(target, op)?;
    }
    Ok(())
}

fn apply_op(target: &mut Value, op: &PatchOp) -> Result<()> {
    let Some((last, parents)) = op.path.split_last() else {
        return match &op.value {
            Some(value) => {
                *target = value.clone();
                Ok(())
            }
            None => Err(Error::GossipMalformed("cannot remove the root".into())),
        };
    };

    let mut cursor = target;
    for key in parents {
        cursor = match key {
            PathKey::Key(k) => {
                if cursor.is_null() && op.value.is_some() {
                    *cursor = Value::Object(Map::new());
                }
                let map = cursor.as_object_mut().ok_or_else(|| {
                    Error::GossipMalformed(format!("{:?}: not an object", op.path))
                })?;
                if op.value.is_some() {
                    map.entry(k.clone()).or_insert(Value::Null)
                } else {
                    match map.get_mut(k) {
                        Some(v) => v,
                        // removing below a missing key is a no-op
                        None => return Ok(()),
                    }
                }
            }
            PathKey::Index(i) => {
                let arr = cursor.as_array_mut().ok_or_else(|| {
                    Error::GossipMalformed(format!("{:?}: not an array", op.path))
                })?;
                arr.get_mut(*i).ok_or_else(|| {
                    Error::GossipMalformed(format!("{:?}: index {} out of bounds", op.path, i))
                })?
            }
        };
    }

    match (last, &op.value) {
        (PathKey::Key(k), Some(value)) => {
            if cursor.is_null() {
                *cursor = Value::Object(Map::new());
            }
            let map = cursor
                .as_object_mut()
                .ok_or_else(|| Error::GossipMalformed(format!("{:?}: not an object", op.path)))?;
            map.insert(k.clone(), value.clone());
        }
        (PathKey::Key(k), None) => {
            if let Some(map) = cursor.as_object_mut() {
                map.remove(k);
            }
        }
        (PathKey::Index(i), Some(value)) => {
            let arr = cursor
                .as_array_mut()
                .ok_or_else(|| Error::GossipMalformed(format!("{:?}: not an array", op.path)))?;
            match (*i).cmp(&arr.len()) {
                std::cmp::Ordering::Less => arr[*i] = value.clone(),
                std::cmp::Ordering::Equal => arr.push(value.clone()),
                std::cmp::Ordering::Greater => {
                    return Err(Error::GossipMalformed(format!(
                        "{:?}: index {} past end {}",
                        op.path,
                        i,
                        arr.len()
                    )))
                }
            }
        }
        (PathKey::Index(i), None) => {
            let arr = cursor
                .as_array_mut()
                .ok_or_else(|| Error::GossipMalformed(format!("{:?}: not an array", op.path)))?;
            if *i < arr.len() {
                arr.remove(*i);
            }
        }
    }
    Ok(())
}

/// Apply `ops` to a copy of `snapshot`. `generation` only changes when the
/// patch carries a `["generation"]` op.
pub fn apply_patch_to_snapshot(snapshot: &NodeSnapshot, ops: &[PatchOp]) -> Result<NodeSnapshot> {
    let mut value = serde_json::to_value(snapshot)?;
    apply_patch(&mut value, ops)?;
    serde_json::from_value(value).map_err(|e| Error::GossipMalformed(e.to_string()))
}

#[derive(Debug, Default)]
struct CodecState {
    /// Last published snapshot, as of `generation`
    last: Option<Value>,
    boot: u64,
    generation: u64,
    updated: f64,
    outbox: VecDeque<GossipMessage>,
    /// Lazily built full snapshot of `generation`
    full_cache: Option<Arc<GossipMessage>>,
    /// Peers whose replica we must rebuild from a full snapshot
    resync_needed: BTreeSet<String>,
}

/// Produces the local node's patches and ingests peers' ones.
pub struct GossipCodec {
    nodename: String,
    state: Mutex<CodecState>,
}

impl GossipCodec {
    pub fn new(nodename: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            state: Mutex::new(CodecState::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Diff the current local snapshot against the last published one.
    ///
    /// Returns the new generation when a patch was produced. Without changes
    /// only `updated` is refreshed.
    pub fn publish(&self, store: &StateStore) -> Result<Option<u64>> {
        let now = store.now();
        let local = store.local_snapshot();
        let boot = local.boot;
        let current = serde_json::to_value(local)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.updated = now;
        state.boot = boot;

        let message = match state.last.as_ref() {
            None => {
                state.generation += 1;
                let mut snapshot = current.clone();
                stamp(&mut snapshot, state.generation, now);
                GossipMessage::Full {
                    node: self.nodename.clone(),
                    boot,
                    generation: state.generation,
                    snapshot,
                }
            }
            Some(last) => {
                let mut ops = compute_diff(last, &current);
                if ops.is_empty() {
                    let generation = state.generation;
                    drop(guard);
                    store.set_local_generation(generation, now);
                    return Ok(None);
                }
                state.generation += 1;
                ops.push(PatchOp::set(vec!["updated".into()], Value::from(now)));
                GossipMessage::Patch {
                    node: self.nodename.clone(),
                    boot,
                    generation: state.generation,
                    ops,
                }
            }
        };

        let generation = state.generation;
        state.last = Some(current);
        state.full_cache = None;
        if state.outbox.len() >= MAX_OUTBOX {
            state.outbox.pop_front();
        }
        state.outbox.push_back(message);
        drop(guard);

        store.set_local_generation(generation, now);
        debug!(generation, "local snapshot changed");
        Ok(Some(generation))
    }

    /// Drain queued messages for the transport.
    pub fn take_outbox(&self) -> Vec<GossipMessage> {
        self.state.lock().outbox.drain(..).collect()
    }

    /// Full snapshot of the last published generation, serialized on demand.
    pub fn full_snapshot(&self) -> Option<Arc<GossipMessage>> {
        let mut state = self.state.lock();
        if state.full_cache.is_none() {
            let mut snapshot = state.last.clone()?;
            stamp(&mut snapshot, state.generation, state.updated);
            state.full_cache = Some(Arc::new(GossipMessage::Full {
                node: self.nodename.clone(),
                boot: state.boot,
                generation: state.generation,
                snapshot,
            }));
        }
        state.full_cache.clone()
    }

    /// Peers we need a full snapshot from. Drains the set.
    pub fn take_resync_requests(&self) -> Vec<String> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.resync_needed).into_iter().collect()
    }

    fn flag_resync(&self, node: &str) {
        if self.state.lock().resync_needed.insert(node.to_string()) {
            info!(node = %node, "request full snapshot resync");
        }
    }

    /// Apply a peer message onto the local replica of that peer.
    pub fn ingest(&self, store: &StateStore, message: GossipMessage) -> Result<Ingested> {
        let node = message.node().to_string();
        if node == self.nodename {
            return Ok(Ingested::Discarded);
        }
        let replica = store.peer(&node);

        match message {
            GossipMessage::Full {
                boot,
                generation,
                snapshot,
                ..
            } => {
                if let Some(replica) = &replica {
                    let stale = boot < replica.boot
                        || (boot == replica.boot && generation < replica.generation);
                    if stale {
                        debug!(node = %node, boot, generation, have = replica.generation, "discard stale full snapshot");
                        return Ok(Ingested::Discarded);
                    }
                    if boot > replica.boot {
                        info!(node = %node, boot, "peer restarted, replace its snapshot");
                    }
                }
                let mut snapshot: NodeSnapshot = serde_json::from_value(snapshot)
                    .map_err(|e| Error::GossipMalformed(e.to_string()))?;
                snapshot.boot = boot;
                snapshot.generation = generation;
                store.put_peer(&node, snapshot);
                self.state.lock().resync_needed.remove(&node);
                Ok(Ingested::Replaced)
            }
            GossipMessage::Patch {
                boot, generation, ops, ..
            } => {
                let Some(replica) = replica else {
                    self.flag_resync(&node);
                    return Ok(Ingested::Discarded);
                };
                if boot < replica.boot {
                    debug!(node = %node, boot, have = replica.boot, "discard patch from a previous boot");
                    return Ok(Ingested::Discarded);
                }
                if boot > replica.boot {
                    debug!(node = %node, boot, have = replica.boot, "patch from a new boot");
                    self.flag_resync(&node);
                    return Ok(Ingested::Discarded);
                }
                if generation <= replica.generation {
                    debug!(node = %node, generation, have = replica.generation, "discard stale patch");
                    return Ok(Ingested::Discarded);
                }
                if generation != replica.generation + 1 {
                    debug!(node = %node, generation, have = replica.generation, "generation gap");
                    self.flag_resync(&node);
                    return Ok(Ingested::Discarded);
                }
                let mut patched = match apply_patch_to_snapshot(&replica, &ops) {
                    Ok(patched) => patched,
                    Err(e) => {
                        warn!(node = %node, generation, "{}", e);
                        self.flag_resync(&node);
                        return Err(e);
                    }
                };
                patched.generation = generation;
                store.put_peer(&node, patched);
                Ok(Ingested::Applied)
            }
        }
    }
}

fn stamp(snapshot: &mut Value, generation: u64, updated: f64) {
    if let Value::Object(map) = snapshot {
        map.insert("generation".into(), Value::from(generation));
        map.insert("updated".into(), Value::from(updated));
    }
}
