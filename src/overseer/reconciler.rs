//! Async completion reconciliation
//!
//! A member that accepts an async request writes a completion marker under
//! [`ASYNC_IDS_ROOT`](crate::overseer::store::ASYNC_IDS_ROOT) when the work
//! reaches a terminal state. The reconciler waits (bounded) for that marker,
//! then asks the member for the request status and maps it onto a result.

use crate::common::{base_url_for_node_name, Error, Result};
use crate::overseer::store::{async_marker_path, CoordinationStore, WatchEvent};
use crate::overseer::transport::{MemberClient, Params, Purpose, ShardRequest, ACTION, QT, REQUEST_ID};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Status key of a status-query response
pub const STATUS: &str = "STATUS";

/// Terminal state reported by a member for an async request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    Completed,
    Failed,
}

/// Outcome of reconciling one async request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: AsyncStatus,
    pub response: Value,
}

#[derive(Clone)]
pub struct AsyncReconciler {
    store: Arc<dyn CoordinationStore>,
    client: Arc<dyn MemberClient>,
    admin_path: String,
    url_scheme: String,
    wait_bound: Duration,
    cancel: CancellationToken,
}

impl AsyncReconciler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        client: Arc<dyn MemberClient>,
        admin_path: impl Into<String>,
        url_scheme: impl Into<String>,
        wait_bound: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            admin_path: admin_path.into(),
            url_scheme: url_scheme.into(),
            wait_bound,
            cancel,
        }
    }

    /// Wait for `async_id` on `node_name` to finish and fetch its status.
    pub async fn await_completion(&self, node_name: &str, async_id: &str) -> Result<Completion> {
        let marker = async_marker_path(async_id);
        if !self.wait_for_marker(&marker).await? {
            tracing::debug!(
                "No completion marker for {} after {:?}, querying {} anyway",
                async_id,
                self.wait_bound,
                node_name
            );
        }

        let request = ShardRequest {
            node_name: node_name.to_string(),
            base_url: base_url_for_node_name(node_name, &self.url_scheme),
            shard: None,
            params: Params::new()
                .with(ACTION, "REQUESTSTATUS")
                .with(REQUEST_ID, async_id)
                .with(QT, self.admin_path.as_str()),
            purpose: Purpose::StatusQuery,
        };
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Interrupted),
            outcome = self.client.send(&request) => outcome,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) if e.code.is_none() => {
                return Err(Error::NoAsyncResponse(format!(
                    "{} on {}: {}",
                    async_id, node_name, e
                )))
            }
            Err(e) => {
                tracing::warn!("Status request for {} on {} failed: {}", async_id, node_name, e);
                return Ok(Completion {
                    status: AsyncStatus::Failed,
                    response: json!({ STATUS: "failed", "error": e.to_value() }),
                });
            }
        };

        if response.is_null() {
            tracing::warn!("Empty status response for {} on {}", async_id, node_name);
            return Ok(Completion {
                status: AsyncStatus::Failed,
                response: json!({ STATUS: "failed" }),
            });
        }

        let status = response.get(STATUS).and_then(Value::as_str).map(str::to_string);
        match status.as_deref() {
            Some("completed") => {
                self.store.delete(&marker).await?;
                tracing::debug!("Async request {} on {} completed", async_id, node_name);
                Ok(Completion {
                    status: AsyncStatus::Completed,
                    response,
                })
            }
            Some("failed") => {
                tracing::debug!("Async request {} on {} failed", async_id, node_name);
                Ok(Completion {
                    status: AsyncStatus::Failed,
                    response,
                })
            }
            Some("running") => Err(Error::StillRunning {
                async_id: async_id.to_string(),
                status: "running".into(),
            }),
            Some("notfound") => Err(Error::InvalidAsyncId(async_id.to_string())),
            Some(other) => Err(Error::InvalidStatus(other.to_string())),
            None => Err(Error::InvalidStatus("<missing>".into())),
        }
    }

    /// Wait up to the bound for `marker` to appear. Returns whether it did.
    ///
    /// Only creation ends the wait early; every other watch event re-arms.
    async fn wait_for_marker(&self, marker: &str) -> Result<bool> {
        let watch_loop = async {
            loop {
                let (exists, watch) = self.store.watch_exists(marker).await?;
                if exists {
                    return Ok::<_, Error>(());
                }
                match watch.await {
                    Ok(WatchEvent::Created) => return Ok(()),
                    Ok(event) => tracing::trace!("Re-arming watch on {} after {:?}", marker, event),
                    Err(_) => tracing::trace!("Watch on {} dropped, re-arming", marker),
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            waited = tokio::time::timeout(self.wait_bound, watch_loop) => match waited {
                Ok(Ok(())) => Ok(true),
                Ok(Err(e)) => {
                    tracing::warn!("Watch on {} failed: {}", marker, e);
                    Ok(false)
                }
                Err(_) => Ok(false),
            },
        }
    }
}
