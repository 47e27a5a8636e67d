//! Coordination store facade
//!
//! The overseer talks to a strongly-consistent hierarchical key/value store
//! through [`CoordinationStore`]. Watches are one-shot, the way ZooKeeper-style
//! stores deliver them: a caller that wants to keep watching re-arms after
//! each event.
//!
//! [`InMemoryStore`] backs tests and the standalone binary.

use crate::common::{Error, Result};
use crate::overseer::message::Message;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Root under which members record async completion markers
pub const ASYNC_IDS_ROOT: &str = "/overseer/async_ids";
/// Root of the cluster-state update queue
pub const STATE_UPDATE_QUEUE: &str = "/overseer/queue";
/// Root of uploaded config sets
pub const CONFIGS_ROOT: &str = "/configs";
/// Root of per-collection nodes
pub const COLLECTIONS_ROOT: &str = "/collections";

/// Store path of the completion marker for `async_id`.
pub fn async_marker_path(async_id: &str) -> String {
    format!("{}/mn-{}", ASYNC_IDS_ROOT, async_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    /// Connection-level notification that says nothing about the node
    Session,
}

/// One-shot watch. Resolves with the first event on the watched path; an error
/// means the store dropped the watch (treated like a session event).
pub type Watch = oneshot::Receiver<WatchEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: u64,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get_data(&self, path: &str) -> Result<Option<Versioned>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Existence check that leaves a one-shot watch on `path`.
    async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)>;

    /// Create a node; fails with [`Error::NodeExists`] if it is already there.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Write a node. With `expected_version` the write only succeeds against
    /// that version ([`Error::BadVersion`] otherwise); without it the node is
    /// created or overwritten. Returns the new version.
    async fn set_data(&self, path: &str, data: Vec<u8>, expected_version: Option<u64>)
        -> Result<u64>;

    /// Delete a node. Returns whether it existed.
    async fn delete(&self, path: &str) -> Result<bool>;
}

/// Queue of cluster-state mutations consumed by the state updater.
#[async_trait]
pub trait StateUpdateQueue: Send + Sync {
    async fn offer(&self, message: &Message) -> Result<()>;
}

#[derive(Default)]
struct MemState {
    nodes: BTreeMap<String, Versioned>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
}

impl MemState {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watchers) = self.watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(event);
            }
        }
    }

    /// Drop watches whose receiver is gone (timed out or cancelled waits).
    fn prune_watches(&mut self) {
        self.watches.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
    }
}

/// In-process coordination store.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Paths under `prefix`, in order.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        self.state()
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of watches still waiting for an event.
    pub fn watch_count(&self) -> usize {
        let mut state = self.state();
        state.prune_watches();
        state.watches.values().map(Vec::len).sum()
    }

    /// Deliver a session event to every watch on `path`.
    pub fn fire_session_event(&self, path: &str) {
        self.state().fire(path, WatchEvent::Session);
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get_data(&self, path: &str) -> Result<Option<Versioned>> {
        Ok(self.state().nodes.get(path).cloned())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.state().nodes.contains_key(path))
    }

    async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        let exists = state.nodes.contains_key(path);
        state.prune_watches();
        state.watches.entry(path.to_string()).or_default().push(tx);
        Ok((exists, rx))
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        if state.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        state
            .nodes
            .insert(path.to_string(), Versioned { data, version: 0 });
        state.fire(path, WatchEvent::Created);
        Ok(())
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut state = self.state();
        let current = state.nodes.get(path).map(|v| v.version);
        let version = match (current, expected_version) {
            (Some(actual), Some(expected)) if actual != expected => {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual,
                })
            }
            (None, Some(_)) => return Err(Error::Store(format!("no node at {}", path))),
            (Some(actual), _) => actual + 1,
            (None, None) => 0,
        };
        state
            .nodes
            .insert(path.to_string(), Versioned { data, version });
        let event = if current.is_some() {
            WatchEvent::DataChanged
        } else {
            WatchEvent::Created
        };
        state.fire(path, event);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut state = self.state();
        let existed = state.nodes.remove(path).is_some();
        if existed {
            state.fire(path, WatchEvent::Deleted);
        }
        Ok(existed)
    }
}

/// State-update queue stored as sequential `qn-` nodes.
pub struct StoreQueue<S: ?Sized> {
    store: std::sync::Arc<S>,
    root: String,
    seq: AtomicU64,
}

impl<S: CoordinationStore + ?Sized> StoreQueue<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self::with_root(store, STATE_UPDATE_QUEUE)
    }

    pub fn with_root(store: std::sync::Arc<S>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<S: CoordinationStore + ?Sized> StateUpdateQueue for StoreQueue<S> {
    async fn offer(&self, message: &Message) -> Result<()> {
        let data = serde_json::to_vec(message)?;
        loop {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let path = format!("{}/qn-{:010}", self.root, seq);
            match self.store.create(&path, data.clone()).await {
                Err(Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
                Ok(()) => {
                    tracing::debug!(
                        "Offered state update {} for {}",
                        path,
                        message.operation_name()
                    );
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overseer::message::{OperationKind, COLLECTION};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_conditional_set() {
        let store = InMemoryStore::new();
        store.create("/a", b"one".to_vec()).await.unwrap();
        assert!(matches!(
            store.create("/a", vec![]).await,
            Err(Error::NodeExists(_))
        ));

        let v = store.set_data("/a", b"two".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v, 1);
        assert!(matches!(
            store.set_data("/a", b"three".to_vec(), Some(0)).await,
            Err(Error::BadVersion { expected: 0, actual: 1, .. })
        ));
        assert_eq!(store.get_data("/a").await.unwrap().unwrap().data, b"two");

        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_fires_once_on_create() {
        let store = InMemoryStore::new();
        let (exists, watch) = store.watch_exists("/w").await.unwrap();
        assert!(!exists);

        store.create("/w", vec![]).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::Created);

        // one-shot: a second change needs a new watch
        let (exists, watch) = store.watch_exists("/w").await.unwrap();
        assert!(exists);
        store.delete("/w").await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn test_abandoned_watches_are_dropped() {
        let store = InMemoryStore::new();
        for _ in 0..1000 {
            let (_, watch) = store.watch_exists("/never").await.unwrap();
            let waited = tokio::time::timeout(std::time::Duration::from_millis(1), watch).await;
            assert!(waited.is_err());
        }
        assert_eq!(store.watch_count(), 0);

        let (_, live) = store.watch_exists("/never").await.unwrap();
        assert_eq!(store.watch_count(), 1);
        store.create("/never", vec![]).await.unwrap();
        assert_eq!(live.await.unwrap(), WatchEvent::Created);
        assert_eq!(store.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_offers_sequential_nodes() {
        let store = Arc::new(InMemoryStore::new());
        let queue = StoreQueue::new(store.clone());
        let msg = Message::new(OperationKind::ModifyCollection).with(COLLECTION, "c1");
        queue.offer(&msg).await.unwrap();
        queue.offer(&msg).await.unwrap();

        let nodes = store.list(STATE_UPDATE_QUEUE);
        assert_eq!(
            nodes,
            vec![
                "/overseer/queue/qn-0000000000".to_string(),
                "/overseer/queue/qn-0000000001".to_string()
            ]
        );
        let data = store.get_data(&nodes[0]).await.unwrap().unwrap().data;
        let back: Message = serde_json::from_slice(&data).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_marker_path() {
        assert_eq!(async_marker_path("42abc"), "/overseer/async_ids/mn-42abc");
    }
}
