//! Waiting for cluster state to converge

use crate::common::{Error, Result};
use crate::overseer::cluster_state::{ClusterState, ClusterStateCache, ResourceState};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

enum Wake {
    Changed,
    Closed,
    Deadline,
    Cancelled,
}

#[derive(Clone)]
pub struct ClusterStateWaiter {
    cluster: Arc<ClusterStateCache>,
    cancel: CancellationToken,
}

impl ClusterStateWaiter {
    pub fn new(cluster: Arc<ClusterStateCache>, cancel: CancellationToken) -> Self {
        Self { cluster, cancel }
    }

    /// Block until `predicate(live_nodes, resource_state)` holds for
    /// `resource`, checking now and after every published snapshot.
    ///
    /// Returns the snapshot that satisfied the predicate.
    pub async fn wait_for<P>(
        &self,
        resource: &str,
        timeout: Duration,
        mut predicate: P,
    ) -> Result<Arc<ClusterState>>
    where
        P: FnMut(&BTreeSet<String>, Option<&ResourceState>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut rx = self.cluster.subscribe();
        let mut closed = false;
        let mut last = rx.borrow_and_update().clone();

        loop {
            if predicate(&last.live_nodes, last.resource(resource)) {
                return Ok(last);
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                changed = rx.changed(), if !closed => match changed {
                    Ok(()) => Wake::Changed,
                    Err(_) => Wake::Closed,
                },
            };

            match wake {
                Wake::Changed => last = rx.borrow_and_update().clone(),
                Wake::Closed => closed = true,
                Wake::Cancelled => return Err(Error::Interrupted),
                Wake::Deadline => {
                    let last_state = match last.resource(resource) {
                        Some(state) => serde_json::to_string(state)?,
                        None => "absent".to_string(),
                    };
                    return Err(Error::StateConvergenceTimeout {
                        resource: resource.to_string(),
                        timeout,
                        last_state,
                    });
                }
            }
        }
    }
}
