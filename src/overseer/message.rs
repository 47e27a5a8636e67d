//! Admin operation messages
//!
//! A message is a flat, ordered, string-keyed map that always carries an
//! `operation` discriminator. Handlers validate the keys they need; the
//! dispatcher only looks at the operation and the resource key.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Operation discriminator key
pub const OPERATION: &str = "operation";
/// Resource (collection) name
pub const COLLECTION: &str = "collection";
/// Alternate resource name key used by collection-level operations
pub const NAME: &str = "name";
/// Sub-unit (shard) name
pub const SHARD: &str = "shard";
/// Member (replica) name
pub const REPLICA: &str = "replica";
/// Async correlation id supplied by the caller
pub const ASYNC: &str = "async";
/// Entries under this prefix are passed verbatim to member requests
pub const PROPERTY_PREFIX: &str = "property.";

/// Depth at which an operation takes its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockLevel {
    /// Never conflicts with anything
    None,
    Cluster,
    Collection,
    Shard,
    Replica,
}

impl LockLevel {
    /// Number of resource-key segments covered by a lock at this level.
    ///
    /// `None` has no depth: it is handed a free lock.
    pub fn depth(&self) -> Option<usize> {
        match self {
            LockLevel::None => None,
            LockLevel::Cluster => Some(0),
            LockLevel::Collection => Some(1),
            LockLevel::Shard => Some(2),
            LockLevel::Replica => Some(3),
        }
    }
}

/// Closed set of admin operations the overseer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Delete,
    Reload,
    SplitShard,
    CreateShard,
    DeleteShard,
    AddReplica,
    DeleteReplica,
    MoveReplica,
    Migrate,
    ModifyCollection,
    AddReplicaProp,
    DeleteReplicaProp,
    BalanceShardUnique,
    RebalanceLeaders,
    Backup,
    Restore,
    CreateSnapshot,
    DeleteSnapshot,
    CreateAlias,
    DeleteAlias,
    AliasProp,
    MaintainRoutedAlias,
    OverseerStatus,
    AddRole,
    RemoveRole,
    ReplaceNode,
    DeleteNode,
    UtilizeNode,
    ReindexCollection,
    Rename,
    #[serde(rename = "mock_coll_task")]
    MockCollTask,
    #[serde(rename = "mock_shard_task")]
    MockShardTask,
    #[serde(rename = "mock_replica_task")]
    MockReplicaTask,
}

impl OperationKind {
    pub const ALL: [OperationKind; 34] = [
        OperationKind::Create,
        OperationKind::Delete,
        OperationKind::Reload,
        OperationKind::SplitShard,
        OperationKind::CreateShard,
        OperationKind::DeleteShard,
        OperationKind::AddReplica,
        OperationKind::DeleteReplica,
        OperationKind::MoveReplica,
        OperationKind::Migrate,
        OperationKind::ModifyCollection,
        OperationKind::AddReplicaProp,
        OperationKind::DeleteReplicaProp,
        OperationKind::BalanceShardUnique,
        OperationKind::RebalanceLeaders,
        OperationKind::Backup,
        OperationKind::Restore,
        OperationKind::CreateSnapshot,
        OperationKind::DeleteSnapshot,
        OperationKind::CreateAlias,
        OperationKind::DeleteAlias,
        OperationKind::AliasProp,
        OperationKind::MaintainRoutedAlias,
        OperationKind::OverseerStatus,
        OperationKind::AddRole,
        OperationKind::RemoveRole,
        OperationKind::ReplaceNode,
        OperationKind::DeleteNode,
        OperationKind::UtilizeNode,
        OperationKind::ReindexCollection,
        OperationKind::Rename,
        OperationKind::MockCollTask,
        OperationKind::MockShardTask,
        OperationKind::MockReplicaTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Delete => "delete",
            OperationKind::Reload => "reload",
            OperationKind::SplitShard => "splitshard",
            OperationKind::CreateShard => "createshard",
            OperationKind::DeleteShard => "deleteshard",
            OperationKind::AddReplica => "addreplica",
            OperationKind::DeleteReplica => "deletereplica",
            OperationKind::MoveReplica => "movereplica",
            OperationKind::Migrate => "migrate",
            OperationKind::ModifyCollection => "modifycollection",
            OperationKind::AddReplicaProp => "addreplicaprop",
            OperationKind::DeleteReplicaProp => "deletereplicaprop",
            OperationKind::BalanceShardUnique => "balanceshardunique",
            OperationKind::RebalanceLeaders => "rebalanceleaders",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::CreateSnapshot => "createsnapshot",
            OperationKind::DeleteSnapshot => "deletesnapshot",
            OperationKind::CreateAlias => "createalias",
            OperationKind::DeleteAlias => "deletealias",
            OperationKind::AliasProp => "aliasprop",
            OperationKind::MaintainRoutedAlias => "maintainroutedalias",
            OperationKind::OverseerStatus => "overseerstatus",
            OperationKind::AddRole => "addrole",
            OperationKind::RemoveRole => "removerole",
            OperationKind::ReplaceNode => "replacenode",
            OperationKind::DeleteNode => "deletenode",
            OperationKind::UtilizeNode => "utilizenode",
            OperationKind::ReindexCollection => "reindexcollection",
            OperationKind::Rename => "rename",
            OperationKind::MockCollTask => "mock_coll_task",
            OperationKind::MockShardTask => "mock_shard_task",
            OperationKind::MockReplicaTask => "mock_replica_task",
        }
    }

    /// Lock depth taken by this operation in the lock tree.
    pub fn lock_level(&self) -> LockLevel {
        use OperationKind::*;
        match self {
            OverseerStatus | AddRole | RemoveRole | ReplaceNode | DeleteNode | UtilizeNode => {
                LockLevel::None
            }
            SplitShard | DeleteShard | AddReplica | DeleteReplica | MoveReplica | Migrate
            | BalanceShardUnique | MockShardTask => LockLevel::Shard,
            AddReplicaProp | DeleteReplicaProp | MockReplicaTask => LockLevel::Replica,
            _ => LockLevel::Collection,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        OperationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| Error::UnknownOperation(s.to_string()))
    }
}

/// `(resource, sub-unit, member)` triple; any suffix may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource: Option<String>,
    pub sub_unit: Option<String>,
    pub member: Option<String>,
}

impl ResourceKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Default::default()
        }
    }

    pub fn with_sub_unit(mut self, sub_unit: impl Into<String>) -> Self {
        self.sub_unit = Some(sub_unit.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Path segments in hierarchy order. Absent segments are kept as `None`
    /// so a lock at a given depth can tell "unspecified" apart from "empty".
    pub fn segments(&self) -> [Option<&str>; 3] {
        [
            self.resource.as_deref(),
            self.sub_unit.as_deref(),
            self.member.as_deref(),
        ]
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .segments()
            .iter()
            .map(|s| s.unwrap_or("*"))
            .collect();
        write!(f, "{}", parts.join("/"))
    }
}

/// An admin operation message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    props: Map<String, Value>,
}

impl Message {
    pub fn new(operation: OperationKind) -> Self {
        let mut props = Map::new();
        props.insert(OPERATION.to_string(), Value::from(operation.as_str()));
        Self { props }
    }

    /// Build from raw properties; the operation key must be present.
    pub fn from_map(props: Map<String, Value>) -> Result<Self> {
        match props.get(OPERATION) {
            Some(Value::String(_)) => Ok(Self { props }),
            _ => Err(Error::BadRequest(format!(
                "message is missing the '{}' key",
                OPERATION
            ))),
        }
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Raw operation name as submitted
    pub fn operation_name(&self) -> &str {
        self.props
            .get(OPERATION)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn operation(&self) -> Result<OperationKind> {
        self.operation_name().parse()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// String form of a scalar value; `null` and missing keys are `None`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.props.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.props.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.props
    }

    /// Resource the message targets: `collection`, falling back to `name`.
    pub fn task_key(&self) -> Option<String> {
        self.get_str(COLLECTION).or_else(|| self.get_str(NAME))
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            resource: self.task_key(),
            sub_unit: self.get_str(SHARD),
            member: self.get_str(REPLICA),
        }
    }

    pub fn async_id(&self) -> Option<String> {
        self.get_str(ASYNC)
    }

    /// Fail with a bad request unless every key is present and non-null.
    pub fn check_required(&self, keys: &[&str]) -> Result<()> {
        if keys.iter().all(|k| self.get_str(k).is_some()) {
            Ok(())
        } else {
            Err(Error::BadRequest(format!(
                "{} are required params",
                keys.join(",")
            )))
        }
    }

    /// `property.*` entries, passed verbatim to downstream parameter sets.
    pub fn property_params(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.props.iter().filter_map(|(k, v)| {
            if !k.starts_with(PROPERTY_PREFIX) {
                return None;
            }
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((k.as_str(), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_round_trip_names() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert_eq!(
            "MODIFYCOLLECTION".parse::<OperationKind>().unwrap(),
            OperationKind::ModifyCollection
        );
        assert!(matches!(
            "explode".parse::<OperationKind>(),
            Err(Error::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_serde_names_match_as_str() {
        let value = serde_json::to_value(OperationKind::MockShardTask).unwrap();
        assert_eq!(value, json!("mock_shard_task"));
        let value = serde_json::to_value(OperationKind::SplitShard).unwrap();
        assert_eq!(value, json!("splitshard"));
    }

    #[test]
    fn test_lock_levels() {
        assert_eq!(OperationKind::Reload.lock_level(), LockLevel::Collection);
        assert_eq!(OperationKind::SplitShard.lock_level(), LockLevel::Shard);
        assert_eq!(OperationKind::AddReplicaProp.lock_level(), LockLevel::Replica);
        assert_eq!(OperationKind::OverseerStatus.lock_level(), LockLevel::None);
        assert_eq!(LockLevel::None.depth(), None);
        assert_eq!(LockLevel::Shard.depth(), Some(2));
    }

    #[test]
    fn test_resource_key_prefers_collection() {
        let msg = Message::new(OperationKind::Reload)
            .with(NAME, "by-name")
            .with(COLLECTION, "by-collection")
            .with(SHARD, "shard1");
        let key = msg.resource_key();
        assert_eq!(key.resource.as_deref(), Some("by-collection"));
        assert_eq!(key.sub_unit.as_deref(), Some("shard1"));
        assert_eq!(key.member, None);
        assert_eq!(key.to_string(), "by-collection/shard1/*");

        let msg = Message::new(OperationKind::Delete).with(NAME, "only-name");
        assert_eq!(msg.task_key().as_deref(), Some("only-name"));
    }

    #[test]
    fn test_check_required() {
        let msg = Message::new(OperationKind::AddReplicaProp)
            .with(COLLECTION, "c1")
            .with(SHARD, Value::Null);
        assert!(msg.check_required(&[COLLECTION]).is_ok());
        let err = msg.check_required(&[COLLECTION, SHARD]).unwrap_err();
        assert!(err.to_string().contains("collection,shard are required"));
    }

    #[test]
    fn test_property_params() {
        let msg = Message::new(OperationKind::Create)
            .with("property.color", "blue")
            .with("property.size", 3)
            .with("other", "x");
        let props: Vec<(&str, String)> = msg.property_params().collect();
        assert_eq!(
            props,
            vec![
                ("property.color", "blue".to_string()),
                ("property.size", "3".to_string())
            ]
        );
    }

    #[test]
    fn test_from_map_requires_operation() {
        let map = json!({"collection": "c1"}).as_object().cloned().unwrap();
        assert!(Message::from_map(map).is_err());

        let map = json!({"operation": "reload", "collection": "c1"})
            .as_object()
            .cloned()
            .unwrap();
        let msg = Message::from_map(map).unwrap();
        assert_eq!(msg.operation().unwrap(), OperationKind::Reload);
    }
}
