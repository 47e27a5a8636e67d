//! Configuration for the overseer

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::Result;

/// Overseer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverseerConfig {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Bind address for the admin HTTP API
    pub bind_addr: SocketAddr,

    /// Admin handler path on cluster members (sent as `qt`)
    pub admin_path: String,

    /// Scheme used when turning node names into base URLs
    pub url_scheme: String,

    /// Maximum number of admin tasks running at once
    pub max_parallel_tasks: usize,

    /// Bound on the completion-marker wait before a status query
    pub async_wait_timeout_ms: u64,

    /// Wait for a freshly created shard to become visible
    pub new_shard_timeout_ms: u64,

    /// Wait for a modifycollection update to land in cluster state
    pub modify_timeout_ms: u64,

    /// Wait for replicas to show up in cluster state
    pub replica_visibility_timeout_ms: u64,

    /// Wait for a core to be assigned a core node name
    pub core_node_name_timeout_ms: u64,

    /// Delay before blocked tasks are retried when nothing else wakes the loop
    pub requeue_backoff_ms: u64,

    /// Per-request timeout for member admin calls
    pub member_request_timeout_ms: u64,

    /// Logging level
    pub log_level: String,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            node_id: "overseer-1".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5400)),
            admin_path: "/admin/cores".to_string(),
            url_scheme: "http".to_string(),
            max_parallel_tasks: 100,
            async_wait_timeout_ms: 15_000,
            new_shard_timeout_ms: 30_000,
            modify_timeout_ms: 30_000,
            replica_visibility_timeout_ms: 10_000,
            core_node_name_timeout_ms: 15_000,
            requeue_backoff_ms: 100,
            member_request_timeout_ms: 60_000,
            log_level: "info".to_string(),
        }
    }
}

impl OverseerConfig {
    /// Load from `overseer.toml` (if present) and `OVERSEER__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`OverseerConfig::load`], with an extra explicit file layered on top.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("overseer").required(false));
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("OVERSEER").separator("__"))
            .build()?;
        let config: OverseerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if !self.admin_path.starts_with('/') {
            return Err(crate::Error::InvalidConfig(format!(
                "admin_path must start with '/': {}",
                self.admin_path
            )));
        }
        if self.max_parallel_tasks == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_parallel_tasks must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn async_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.async_wait_timeout_ms)
    }

    pub fn new_shard_timeout(&self) -> Duration {
        Duration::from_millis(self.new_shard_timeout_ms)
    }

    pub fn modify_timeout(&self) -> Duration {
        Duration::from_millis(self.modify_timeout_ms)
    }

    pub fn replica_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_visibility_timeout_ms)
    }

    pub fn core_node_name_timeout(&self) -> Duration {
        Duration::from_millis(self.core_node_name_timeout_ms)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    pub fn member_request_timeout(&self) -> Duration {
        Duration::from_millis(self.member_request_timeout_ms)
    }
}
