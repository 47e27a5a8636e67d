//! Fan-out / fan-in of per-member admin requests
//!
//! A [`ShardRequestTracker`] lives for one fan-out. Requests go out through a
//! [`ShardHandler`]; [`ShardRequestTracker::drain`] collects every response
//! into an [`OperationResult`] and, for an async tracker, reconciles each
//! acknowledged request once the synchronous responses are in.

use crate::common::{generate_async_id, Error, Result};
use crate::overseer::cluster_state::{ClusterState, Member, MemberState, SubUnit};
use crate::overseer::message::ASYNC;
use crate::overseer::reconciler::{AsyncReconciler, AsyncStatus};
use crate::overseer::results::OperationResult;
use crate::overseer::transport::{
    MemberClient, Params, Purpose, ShardHandler, ShardRequest, ShardResponse, CORE, QT,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of dispatching to the members of one sub-unit.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Requests actually sent
    pub dispatched: usize,
    /// Members on nodes that are not live; nothing was sent to them
    pub unreachable: Vec<Member>,
    /// Members skipped by the state filter
    pub filtered: Vec<Member>,
}

impl FanOut {
    pub fn merge(&mut self, other: FanOut) {
        self.dispatched += other.dispatched;
        self.unreachable.extend(other.unreachable);
        self.filtered.extend(other.filtered);
    }
}

pub struct ShardRequestTracker {
    async_prefix: Option<String>,
    admin_path: String,
    handler: ShardHandler,
    reconciler: AsyncReconciler,
    cancel: CancellationToken,
    /// (node name, async id) of every async request sent by this tracker
    pending_async: Vec<(String, String)>,
}

impl ShardRequestTracker {
    pub fn new(
        async_prefix: Option<String>,
        admin_path: impl Into<String>,
        client: Arc<dyn MemberClient>,
        reconciler: AsyncReconciler,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            async_prefix,
            admin_path: admin_path.into(),
            handler: ShardHandler::new(client),
            reconciler,
            cancel,
            pending_async: Vec::new(),
        }
    }

    pub fn is_async(&self) -> bool {
        self.async_prefix.is_some()
    }

    /// Async requests awaiting reconciliation.
    pub fn pending_async(&self) -> &[(String, String)] {
        &self.pending_async
    }

    /// Send `params` to every member of `sub_unit` that passes `state_filter`
    /// and sits on a live node.
    pub fn target_members(
        &mut self,
        cluster: &ClusterState,
        params: &Params,
        state_filter: Option<MemberState>,
        sub_unit: &SubUnit,
    ) -> FanOut {
        let mut fan_out = FanOut::default();
        for member in sub_unit.members.values() {
            if state_filter.is_some_and(|wanted| member.state != wanted) {
                fan_out.filtered.push(member.clone());
                continue;
            }
            if !cluster.is_live(&member.node_name) {
                tracing::warn!(
                    "Member {} of {} is on {} which is not live",
                    member.name,
                    sub_unit.name,
                    member.node_name
                );
                fan_out.unreachable.push(member.clone());
                continue;
            }

            let mut member_params = params.clone();
            member_params.set(CORE, member.core.as_str());
            self.send_shard_request(
                &member.node_name,
                &member.base_url,
                Some(&sub_unit.name),
                member_params,
            );
            fan_out.dispatched += 1;
        }
        fan_out
    }

    /// Submit one request. An async tracker stamps a fresh async id on it and
    /// remembers it for reconciliation.
    pub fn send_shard_request(
        &mut self,
        node_name: &str,
        base_url: &str,
        shard: Option<&str>,
        mut params: Params,
    ) {
        if let Some(prefix) = &self.async_prefix {
            let async_id = generate_async_id(prefix);
            params.set(ASYNC, async_id.as_str());
            self.pending_async.push((node_name.to_string(), async_id));
        }
        params.set(QT, self.admin_path.as_str());

        tracing::debug!("Sending {:?} to {}", params.get("action"), node_name);
        self.handler.submit(ShardRequest {
            node_name: node_name.to_string(),
            base_url: base_url.to_string(),
            shard: shard.map(str::to_string),
            params,
            purpose: Purpose::Admin,
        });
    }

    /// Collect every outstanding response into `results`.
    ///
    /// A response is a failure unless it succeeded or its root cause is listed
    /// in `okay_exceptions`. With `abort_on_error`, the first failure stops
    /// recording: remaining responses are drained and discarded and a single
    /// [`Error::ShardRequestFailed`] is returned.
    pub async fn drain(
        &mut self,
        results: &mut OperationResult,
        abort_on_error: bool,
        error_message: Option<&str>,
        okay_exceptions: &HashSet<String>,
    ) -> Result<()> {
        while let Some(response) = self.next_response().await? {
            let Some(cause) = record_response(results, &response, okay_exceptions) else {
                continue;
            };
            if abort_on_error {
                while self.next_response().await?.is_some() {}
                self.pending_async.clear();
                return Err(Error::ShardRequestFailed {
                    message: error_message.unwrap_or("Shard request failed").to_string(),
                    cause,
                });
            }
        }

        for (node_name, async_id) in std::mem::take(&mut self.pending_async) {
            let completion = self.reconciler.await_completion(&node_name, &async_id).await?;
            match completion.status {
                AsyncStatus::Completed => results.add_success(async_id, completion.response),
                AsyncStatus::Failed => results.add_failure(async_id, completion.response),
            }
        }
        Ok(())
    }

    async fn next_response(&mut self) -> Result<Option<ShardResponse>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.handler.cancel_all();
                self.pending_async.clear();
                Err(Error::Interrupted)
            }
            response = self.handler.take_completed_or_error() => Ok(response),
        }
    }
}

/// Record one response. Returns the failure text if it counts as a failure.
fn record_response(
    results: &mut OperationResult,
    response: &ShardResponse,
    okay_exceptions: &HashSet<String>,
) -> Option<String> {
    match &response.outcome {
        Ok(value) => {
            results.add_success(response.result_key(), value.clone());
            None
        }
        Err(e)
            if e
                .root_cause
                .as_ref()
                .is_some_and(|cause| okay_exceptions.contains(cause)) =>
        {
            tracing::debug!("Tolerating {} from {}", e, response.node_name);
            results.add_success(response.result_key(), e.to_value());
            None
        }
        Err(e) => {
            tracing::error!(
                "Error from shard {} on {}: {}",
                response.shard.as_deref().unwrap_or("-"),
                response.node_name,
                e
            );
            results.add_failure(response.result_key(), e.to_value());
            Some(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overseer::mock::MockMemberClient;
    use crate::overseer::store::InMemoryStore;
    use crate::overseer::transport::RemoteError;
    use serde_json::json;
    use std::time::Duration;

    fn member(name: &str, node: &str, state: MemberState) -> Member {
        Member {
            name: name.to_string(),
            core: format!("c1_{}", name),
            node_name: node.to_string(),
            base_url: format!("http://{}", node),
            state,
            leader: false,
        }
    }

    fn tracker(client: Arc<MockMemberClient>, prefix: Option<&str>) -> ShardRequestTracker {
        let cancel = CancellationToken::new();
        let reconciler = AsyncReconciler::new(
            Arc::new(InMemoryStore::new()),
            client.clone(),
            "/admin/cores",
            "http",
            Duration::from_millis(10),
            cancel.clone(),
        );
        ShardRequestTracker::new(
            prefix.map(str::to_string),
            "/admin/cores",
            client,
            reconciler,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_sync_tracker_stamps_core_and_qt() {
        let client = Arc::new(MockMemberClient::ok());
        let mut tracker = tracker(client.clone(), None);
        let cluster = ClusterState::new().with_live_node("n1");
        let shard = SubUnit::new("shard1").with_member(member("r1", "n1", MemberState::Active));

        let fan_out = tracker.target_members(
            &cluster,
            &Params::new().with("action", "RELOAD"),
            None,
            &shard,
        );
        assert_eq!(fan_out.dispatched, 1);
        assert!(!tracker.is_async());

        let mut results = OperationResult::new();
        tracker
            .drain(&mut results, false, None, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(results.success_count(), 1);

        let sent = client.requests();
        assert_eq!(sent[0].params.get(CORE), Some("c1_r1"));
        assert_eq!(sent[0].params.get(QT), Some("/admin/cores"));
        assert_eq!(sent[0].async_id(), None);
    }

    #[tokio::test]
    async fn test_okay_exceptions_count_as_success() {
        let client = Arc::new(MockMemberClient::new(|_| {
            Err(RemoteError::remote(404, "no such core").with_root_cause("NoSuchCore"))
        }));
        let mut tracker = tracker(client, None);
        tracker.send_shard_request("n1", "http://n1", None, Params::new());
        tracker.send_shard_request("n2", "http://n2", None, Params::new());

        let okay: HashSet<String> = ["NoSuchCore".to_string()].into_iter().collect();
        let mut results = OperationResult::new();
        tracker.drain(&mut results, true, None, &okay).await.unwrap();
        assert_eq!(results.success_count(), 2);
        assert_eq!(results.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_async_requests_are_reconciled_by_id() {
        let client = Arc::new(MockMemberClient::new(|req| {
            if req.purpose == Purpose::StatusQuery {
                Ok(json!({"STATUS": "completed"}))
            } else {
                Ok(json!({"status": 0}))
            }
        }));
        let mut tracker = tracker(client.clone(), Some("job7"));
        tracker.send_shard_request("n1", "http://n1", None, Params::new());
        assert_eq!(tracker.pending_async().len(), 1);
        let async_id = tracker.pending_async()[0].1.clone();
        assert!(async_id.starts_with("job7"));

        let mut results = OperationResult::new();
        tracker
            .drain(&mut results, false, None, &HashSet::new())
            .await
            .unwrap();
        assert!(tracker.pending_async().is_empty());
        let success = results.success().unwrap();
        assert!(success.contains_key("n1"));
        assert_eq!(success[&async_id], json!({"STATUS": "completed"}));

        let admin = client
            .requests()
            .into_iter()
            .find(|r| r.purpose == Purpose::Admin)
            .unwrap();
        assert_eq!(admin.async_id(), Some(async_id.as_str()));
    }

    #[tokio::test]
    async fn test_cancelled_drain_is_interrupted() {
        let client = Arc::new(MockMemberClient::ok().with_delay("n1", Duration::from_secs(60)));
        let mut tracker = tracker(client, Some("a"));
        tracker.send_shard_request("n1", "http://n1", None, Params::new());
        tracker.cancel.cancel();

        let mut results = OperationResult::new();
        let err = tracker
            .drain(&mut results, false, None, &HashSet::new())
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(tracker.pending_async().is_empty());
        assert_eq!(results.success_count(), 0);
    }
}
