//! Shared services handed to every command

use crate::common::{Error, OverseerConfig, Result};
use crate::overseer::cluster_state::{ClusterStateCache, Member, MemberState};
use crate::overseer::message::Message;
use crate::overseer::reconciler::AsyncReconciler;
use crate::overseer::results::OperationResult;
use crate::overseer::store::{
    CoordinationStore, StateUpdateQueue, StoreQueue, COLLECTIONS_ROOT, CONFIGS_ROOT,
};
use crate::overseer::tracker::{FanOut, ShardRequestTracker};
use crate::overseer::transport::{MemberClient, Params};
use crate::overseer::waiter::ClusterStateWaiter;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct OverseerContext {
    pub config: OverseerConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub cluster: Arc<ClusterStateCache>,
    pub client: Arc<dyn MemberClient>,
    pub state_updates: Arc<dyn StateUpdateQueue>,
    /// Shutdown signal observed at every blocking point
    pub cancel: CancellationToken,
}

impl OverseerContext {
    pub fn new(
        config: OverseerConfig,
        store: Arc<dyn CoordinationStore>,
        cluster: Arc<ClusterStateCache>,
        client: Arc<dyn MemberClient>,
    ) -> Self {
        let state_updates: Arc<dyn StateUpdateQueue> = Arc::new(StoreQueue::new(store.clone()));
        Self {
            config,
            store,
            cluster,
            client,
            state_updates,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_state_updates(mut self, queue: Arc<dyn StateUpdateQueue>) -> Self {
        self.state_updates = queue;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reconciler(&self) -> AsyncReconciler {
        AsyncReconciler::new(
            self.store.clone(),
            self.client.clone(),
            self.config.admin_path.as_str(),
            self.config.url_scheme.as_str(),
            self.config.async_wait_timeout(),
            self.cancel.clone(),
        )
    }

    pub fn waiter(&self) -> ClusterStateWaiter {
        ClusterStateWaiter::new(self.cluster.clone(), self.cancel.clone())
    }

    /// Tracker whose requests are answered synchronously.
    pub fn sync_tracker(&self) -> ShardRequestTracker {
        self.async_tracker(None)
    }

    /// Tracker stamping async ids derived from `async_id`, if one is given.
    pub fn async_tracker(&self, async_id: Option<&str>) -> ShardRequestTracker {
        ShardRequestTracker::new(
            async_id.map(str::to_string),
            self.config.admin_path.as_str(),
            self.client.clone(),
            self.reconciler(),
            self.cancel.clone(),
        )
    }

    /// Send `params` to every member of `collection` and collect the
    /// responses. Returns `None` when the collection is unknown.
    pub async fn collection_cmd(
        &self,
        collection: &str,
        params: &Params,
        results: &mut OperationResult,
        state_filter: Option<MemberState>,
        async_id: Option<&str>,
        okay_exceptions: &HashSet<String>,
    ) -> Result<Option<FanOut>> {
        tracing::info!("Executing collection cmd={:?}", params.get("action"));
        let cluster = self.cluster.current();
        let Some(resource) = cluster.resource(collection) else {
            tracing::warn!("Collection {} not found in cluster state", collection);
            return Ok(None);
        };

        let mut tracker = self.async_tracker(async_id);
        let mut fan_out = FanOut::default();
        for sub_unit in resource.sub_units.values() {
            fan_out.merge(tracker.target_members(&cluster, params, state_filter, sub_unit));
        }
        tracker
            .drain(results, false, None, okay_exceptions)
            .await?;
        Ok(Some(fan_out))
    }

    pub async fn wait_for_new_shard(&self, collection: &str, shard: &str) -> Result<()> {
        tracing::debug!("Waiting for slice {} of collection {} to be available", shard, collection);
        self.waiter()
            .wait_for(collection, self.config.new_shard_timeout(), |_, c| {
                c.is_some_and(|c| c.sub_unit(shard).is_some())
            })
            .await?;
        Ok(())
    }

    /// Wait until a member for `core` on `node_name` shows up and return its
    /// core node name.
    pub async fn wait_for_core_node_name(
        &self,
        collection: &str,
        node_name: &str,
        core: &str,
    ) -> Result<String> {
        let matches = |m: &&Member| m.node_name == node_name && m.core == core;
        let state = self
            .waiter()
            .wait_for(collection, self.config.core_node_name_timeout(), |_, c| {
                c.is_some_and(|c| c.members().any(|m| matches(&m)))
            })
            .await?;
        state
            .resource(collection)
            .and_then(|c| c.members().find(matches))
            .map(|m| m.name.clone())
            .ok_or_else(|| Error::Internal(format!("Could not find coreNodeName for {}", core)))
    }

    /// Wait until every core in `cores` is visible on a live node, and active
    /// when `require_active` is set. Returns the members keyed by core.
    pub async fn wait_to_see_replicas_in_state(
        &self,
        collection: &str,
        cores: &[String],
        require_active: bool,
    ) -> Result<HashMap<String, Member>> {
        let wanted: HashSet<&str> = cores.iter().map(String::as_str).collect();
        let ready = |live: &std::collections::BTreeSet<String>, m: &Member| {
            wanted.contains(m.core.as_str())
                && live.contains(&m.node_name)
                && (!require_active || m.state == MemberState::Active)
        };

        let state = self
            .waiter()
            .wait_for(collection, self.config.replica_visibility_timeout(), |live, c| {
                c.is_some_and(|c| c.members().filter(|m| ready(live, m)).count() == wanted.len())
            })
            .await?;

        let mut found = HashMap::new();
        if let Some(c) = state.resource(collection) {
            for m in c.members().filter(|m| ready(&state.live_nodes, m)) {
                found.insert(m.core.clone(), m.clone());
            }
        }
        Ok(found)
    }

    /// Copy `property.*` entries of `message` into `params`.
    pub fn add_property_params(message: &Message, params: &mut Params) {
        for (key, value) in message.property_params() {
            params.set(key, value);
        }
    }

    pub async fn validate_config_set(&self, config_name: &str) -> Result<()> {
        let path = format!("{}/{}", CONFIGS_ROOT, config_name);
        if self.store.exists(&path).await? {
            Ok(())
        } else {
            Err(Error::BadRequest(format!(
                "Can not find the specified config set: {}",
                config_name
            )))
        }
    }

    /// Point `collection` at `config_name`, creating its node if needed.
    pub async fn create_conf_node(&self, config_name: &str, collection: &str) -> Result<()> {
        let path = format!("{}/{}", COLLECTIONS_ROOT, collection);
        let data = serde_json::to_vec(&json!({ "configName": config_name }))?;
        self.store.set_data(&path, data, None).await?;
        tracing::debug!("Collection {} now uses config {}", collection, config_name);
        Ok(())
    }
}
