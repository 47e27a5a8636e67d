//! Cluster state snapshots
//!
//! The overseer never mutates cluster state directly. It reads immutable
//! snapshots published by whoever follows the coordination store, and waits on
//! the [`ClusterStateCache`] channel to see its own updates land.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of a member replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Active,
    Down,
    Recovering,
    RecoveryFailed,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Active => write!(f, "active"),
            MemberState::Down => write!(f, "down"),
            MemberState::Recovering => write!(f, "recovering"),
            MemberState::RecoveryFailed => write!(f, "recovery_failed"),
        }
    }
}

/// One replica of a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Core node name, unique within the resource
    pub name: String,
    /// Core hosted by the member
    pub core: String,
    /// Live node the member runs on
    pub node_name: String,
    pub base_url: String,
    pub state: MemberState,
    #[serde(default)]
    pub leader: bool,
}

impl Member {
    pub fn core_url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.core)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubUnit {
    pub name: String,
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
}

impl SubUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.members.insert(member.name.clone(), member);
        self
    }

    pub fn leader(&self) -> Option<&Member> {
        self.members.values().find(|m| m.leader)
    }
}

/// State of one sharded resource (collection).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub name: String,
    /// Free-form resource properties (replication factor, read-only flag, ...)
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub sub_units: BTreeMap<String, SubUnit>,
}

impl ResourceState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_sub_unit(mut self, sub_unit: SubUnit) -> Self {
        self.sub_units.insert(sub_unit.name.clone(), sub_unit);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn sub_unit(&self, name: &str) -> Option<&SubUnit> {
        self.sub_units.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.sub_units.values().flat_map(|s| s.members.values())
    }
}

/// Immutable snapshot of the whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub live_nodes: BTreeSet<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_live_node(mut self, node: impl Into<String>) -> Self {
        self.live_nodes.insert(node.into());
        self
    }

    pub fn with_resource(mut self, resource: ResourceState) -> Self {
        self.resources.insert(resource.name.clone(), resource);
        self
    }

    pub fn is_live(&self, node_name: &str) -> bool {
        self.live_nodes.contains(node_name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }
}

/// Latest cluster state plus change notification.
pub struct ClusterStateCache {
    tx: watch::Sender<Arc<ClusterState>>,
}

impl Default for ClusterStateCache {
    fn default() -> Self {
        Self::new(ClusterState::default())
    }
}

impl ClusterStateCache {
    pub fn new(initial: ClusterState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn current(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    /// Publish a new snapshot; its version is bumped past the current one.
    pub fn publish(&self, mut state: ClusterState) {
        self.tx.send_modify(|current| {
            state.version = state.version.max(current.version + 1);
            *current = Arc::new(state);
        });
    }

    /// Apply `f` to a copy of the current snapshot and publish the result.
    pub fn update(&self, f: impl FnOnce(&mut ClusterState)) {
        self.tx.send_modify(|current| {
            let mut next = ClusterState::clone(current);
            f(&mut next);
            next.version = current.version + 1;
            *current = Arc::new(next);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }
}
