//! Built-in admin commands
//!
//! Placement-heavy operations (create, split, move, ...) are registered by the
//! embedding application. The commands here cover what the overseer can do
//! with nothing but member fan-out, state updates and convergence waits.

use crate::common::{timestamp_now_millis, Error, Result};
use crate::overseer::cluster_state::{ClusterState, MemberState};
use crate::overseer::context::OverseerContext;
use crate::overseer::message::{Message, OperationKind, COLLECTION, OPERATION, REPLICA, SHARD};
use crate::overseer::results::OperationResult;
use crate::overseer::transport::{Params, ACTION, CORE};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

/// Config set a collection uses
pub const COLL_CONF: &str = "collection.configName";
/// Read-only flag of a collection
pub const READ_ONLY: &str = "readOnly";
/// Replica property name
pub const PROPERTY: &str = "property";
/// Replica property value
pub const PROPERTY_VALUE: &str = "property.value";
/// Key recorded by the mock tasks when they finish
pub const MOCK_FINISHED: &str = "MOCK_FINISHED";

#[async_trait]
pub trait Command: Send + Sync {
    async fn call(
        &self,
        ctx: &OverseerContext,
        state: &ClusterState,
        message: &Message,
        results: &mut OperationResult,
    ) -> Result<()>;
}

/// Reload every active member of a collection.
pub struct ReloadCmd;

impl ReloadCmd {
    pub async fn reload(
        ctx: &OverseerContext,
        collection: &str,
        async_id: Option<&str>,
        results: &mut OperationResult,
    ) -> Result<()> {
        Self::reload_with(ctx, collection, Params::new(), async_id, results).await
    }

    /// Reload with extra member params, e.g. `property.*` pass-through.
    async fn reload_with(
        ctx: &OverseerContext,
        collection: &str,
        mut params: Params,
        async_id: Option<&str>,
        results: &mut OperationResult,
    ) -> Result<()> {
        params.set(ACTION, "RELOAD");
        ctx.collection_cmd(
            collection,
            &params,
            results,
            Some(MemberState::Active),
            async_id,
            &HashSet::new(),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Command for ReloadCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        results: &mut OperationResult,
    ) -> Result<()> {
        let collection = message
            .task_key()
            .ok_or_else(|| Error::BadRequest("collection is a required param".into()))?;
        let mut params = Params::new();
        OverseerContext::add_property_params(message, &mut params);
        Self::reload_with(ctx, &collection, params, message.async_id().as_deref(), results).await
    }
}

/// Change collection properties through the state-update queue and wait for
/// the change to become visible.
pub struct ModifyCollectionCmd;

#[async_trait]
impl Command for ModifyCollectionCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        results: &mut OperationResult,
    ) -> Result<()> {
        message.check_required(&[COLLECTION])?;
        let collection = message.get_str(COLLECTION).unwrap_or_default();

        let mut update = message.properties().clone();
        if let Some(config_name) = message.get_str(COLL_CONF) {
            ctx.validate_config_set(&config_name).await?;
            ctx.create_conf_node(&config_name, &collection).await?;
            update.remove(COLL_CONF);
            ReloadCmd::reload(ctx, &collection, None, results).await?;
        }
        let update = Message::from_map(update)?;
        ctx.state_updates.offer(&update).await?;

        let expected: Vec<(String, Value)> = update
            .properties()
            .iter()
            .filter(|(k, _)| k.as_str() != COLLECTION && k.as_str() != OPERATION)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        ctx.waiter()
            .wait_for(&collection, ctx.config.modify_timeout(), |_, c| {
                let Some(c) = c else { return false };
                expected.iter().all(|(key, value)| match value {
                    Value::Null => !c.properties.contains_key(key),
                    value => c.properties.get(key) == Some(value),
                })
            })
            .await
            .map_err(|e| {
                if matches!(e, Error::StateConvergenceTimeout { .. }) {
                    Error::Internal(format!("Could not modify collection {}: {}", collection, e))
                } else {
                    e
                }
            })?;

        if update.contains_key(READ_ONLY) {
            ReloadCmd::reload(ctx, &collection, None, results).await?;
        }
        Ok(())
    }
}

/// Sleep for `sleep` milliseconds (default 1), then record completion.
/// Used to exercise the scheduler without touching members.
pub struct MockTaskCmd;

#[async_trait]
impl Command for MockTaskCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        results: &mut OperationResult,
    ) -> Result<()> {
        let sleep = Duration::from_millis(message.get_u64("sleep").unwrap_or(1));
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Interrupted),
            _ = tokio::time::sleep(sleep) => {}
        }
        results.add(MOCK_FINISHED, json!(timestamp_now_millis()));
        Ok(())
    }
}

/// Add or delete a replica property via a state update.
pub struct ReplicaPropCmd {
    pub add: bool,
}

#[async_trait]
impl Command for ReplicaPropCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        _results: &mut OperationResult,
    ) -> Result<()> {
        if self.add {
            message.check_required(&[COLLECTION, SHARD, REPLICA, PROPERTY, PROPERTY_VALUE])?;
        } else {
            message.check_required(&[COLLECTION, SHARD, REPLICA, PROPERTY])?;
        }
        ctx.state_updates.offer(message).await
    }
}

/// Spread a unique replica property evenly over the shards of a collection.
pub struct BalanceShardUniqueCmd;

#[async_trait]
impl Command for BalanceShardUniqueCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        _results: &mut OperationResult,
    ) -> Result<()> {
        let blank = |key: &str| message.get_str(key).map_or(true, |v| v.trim().is_empty());
        if blank(COLLECTION) || blank(PROPERTY) {
            return Err(Error::BadRequest(format!(
                "The '{}' and '{}' parameters are required for the BALANCESHARDUNIQUE operation, no action taken",
                COLLECTION, PROPERTY
            )));
        }
        ctx.state_updates.offer(message).await
    }
}

/// Ask one member to rejoin leader election.
pub struct RebalanceLeadersCmd;

const REBALANCE_REQUIRED: [&str; 7] = [
    COLLECTION,
    SHARD,
    CORE,
    "election_node",
    "core_node_name",
    "base_url",
    "rejoin_at_head",
];

#[async_trait]
impl Command for RebalanceLeadersCmd {
    async fn call(
        &self,
        ctx: &OverseerContext,
        _state: &ClusterState,
        message: &Message,
        results: &mut OperationResult,
    ) -> Result<()> {
        message.check_required(&REBALANCE_REQUIRED)?;
        let get = |key: &str| message.get_str(key).unwrap_or_default();

        let core = get(CORE);
        let params = Params::new()
            .with(COLLECTION, get(COLLECTION))
            .with(SHARD, get(SHARD))
            .with(ACTION, "REJOINLEADERELECTION")
            .with(CORE, core.as_str())
            .with("core_node_name", get("core_node_name"))
            .with("election_node", get("election_node"))
            .with("base_url", get("base_url"))
            .with("rejoin_at_head", get("rejoin_at_head"));

        let mut tracker = ctx.async_tracker(message.async_id().as_deref());
        tracker.send_shard_request(&core, &get("base_url"), Some(&get(SHARD)), params);
        tracker
            .drain(results, false, None, &HashSet::new())
            .await
    }
}

/// Commands registered by [`DispatcherBuilder::with_builtin_commands`].
///
/// [`DispatcherBuilder::with_builtin_commands`]: crate::overseer::dispatcher::DispatcherBuilder::with_builtin_commands
pub fn builtin_commands() -> Vec<(OperationKind, std::sync::Arc<dyn Command>)> {
    use std::sync::Arc;
    vec![
        (OperationKind::Reload, Arc::new(ReloadCmd) as Arc<dyn Command>),
        (OperationKind::ModifyCollection, Arc::new(ModifyCollectionCmd)),
        (OperationKind::AddReplicaProp, Arc::new(ReplicaPropCmd { add: true })),
        (OperationKind::DeleteReplicaProp, Arc::new(ReplicaPropCmd { add: false })),
        (OperationKind::BalanceShardUnique, Arc::new(BalanceShardUniqueCmd)),
        (OperationKind::RebalanceLeaders, Arc::new(RebalanceLeadersCmd)),
        (OperationKind::MockCollTask, Arc::new(MockTaskCmd)),
        (OperationKind::MockShardTask, Arc::new(MockTaskCmd)),
        (OperationKind::MockReplicaTask, Arc::new(MockTaskCmd)),
    ]
}
