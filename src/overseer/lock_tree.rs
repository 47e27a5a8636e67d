//! Hierarchical, non-blocking mutual exclusion over resource keys
//!
//! The lock space is a trie keyed by path segment (collection → shard →
//! replica). Nodes live in an arena and refer to each other by index. Each
//! node carries at most one holder token and a count of locked nodes beneath
//! it, so the conflict check for a path is a single top-down walk:
//!
//! - any held node on the way down means an ancestor (or the path itself) is locked
//! - a non-zero descendant count at the target means something beneath it is locked
//!
//! Acquisition never waits. A conflicting request gets `None` back and the
//! scheduler decides when to try again. Released paths are pruned right away,
//! so the tree only ever holds the paths that are currently locked.

use crate::overseer::message::{OperationKind, ResourceKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One path segment. Absent key parts (`shard` not given, etc.) are a
/// distinct `None` segment.
pub type Segment = Option<String>;

const ROOT: usize = 0;

#[derive(Debug, Default)]
struct Node {
    parent: Option<usize>,
    segment: Segment,
    children: HashMap<Segment, usize>,
    holder: Option<u64>,
    locked_descendants: usize,
}

#[derive(Debug)]
struct Arena {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    next_token: u64,
    held: usize,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: vec![Some(Node::default())],
            free: Vec::new(),
            next_token: 1,
            held: 0,
        }
    }

    fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Child of `parent` for `segment`, created if missing.
    fn child(&mut self, parent: usize, segment: &Segment) -> usize {
        if let Some(&idx) = self.node(parent).and_then(|n| n.children.get(segment)) {
            return idx;
        }
        let idx = self.alloc(Node {
            parent: Some(parent),
            segment: segment.clone(),
            ..Default::default()
        });
        if let Some(p) = self.node_mut(parent) {
            p.children.insert(segment.clone(), idx);
        }
        idx
    }

    fn try_lock(&mut self, path: &[Segment]) -> Option<(usize, u64)> {
        let mut idx = ROOT;
        for segment in path {
            if self.node(idx).is_some_and(|n| n.holder.is_some()) {
                self.prune(idx);
                return None;
            }
            idx = self.child(idx, segment);
        }

        let target = self.node(idx)?;
        if target.holder.is_some() || target.locked_descendants > 0 {
            self.prune(idx);
            return None;
        }

        let token = self.next_token;
        self.next_token += 1;
        self.held += 1;
        if let Some(node) = self.node_mut(idx) {
            node.holder = Some(token);
        }
        let mut cursor = self.node(idx).and_then(|n| n.parent);
        while let Some(up) = cursor {
            let node = self.node_mut(up)?;
            node.locked_descendants += 1;
            cursor = node.parent;
        }
        Some((idx, token))
    }

    /// Release `token` at `idx`. Stale tokens (already released, or dropped by
    /// a clear) are ignored.
    fn unlock(&mut self, idx: usize, token: u64) -> bool {
        match self.node_mut(idx) {
            Some(node) if node.holder == Some(token) => node.holder = None,
            _ => return false,
        }
        self.held -= 1;
        let mut cursor = self.node(idx).and_then(|n| n.parent);
        while let Some(up) = cursor {
            let Some(node) = self.node_mut(up) else { break };
            node.locked_descendants = node.locked_descendants.saturating_sub(1);
            cursor = node.parent;
        }
        self.prune(idx);
        true
    }

    /// Remove empty nodes from `idx` up towards the root.
    fn prune(&mut self, mut idx: usize) {
        while idx != ROOT {
            let (parent, segment) = match self.node(idx) {
                Some(n)
                    if n.holder.is_none() && n.locked_descendants == 0 && n.children.is_empty() =>
                {
                    (n.parent, n.segment.clone())
                }
                _ => return,
            };
            self.nodes[idx] = None;
            self.free.push(idx);
            let Some(parent) = parent else { return };
            if let Some(p) = self.node_mut(parent) {
                p.children.remove(&segment);
            }
            idx = parent;
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Some(Node::default()));
        self.free.clear();
        self.held = 0;
    }

    fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

/// Shared lock tree. Cloning hands out another reference to the same tree.
#[derive(Clone)]
pub struct LockTree {
    arena: Arc<Mutex<Arena>>,
}

impl Default for LockTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTree {
    pub fn new() -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena::new())),
        }
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to lock `path`. Returns `None` on conflict.
    pub fn try_lock(&self, path: &[Segment]) -> Option<Lock> {
        let (node, token) = self.arena().try_lock(path)?;
        Some(Lock {
            handle: Some(LockHandle {
                arena: self.arena.clone(),
                node,
                token,
                path: display_path(path),
            }),
        })
    }

    /// Drop every lock. Outstanding [`Lock`] values become no-ops.
    pub fn clear(&self) {
        let mut arena = self.arena();
        if arena.held > 0 {
            tracing::warn!("Clearing lock tree with {} held lock(s)", arena.held);
        }
        arena.clear();
    }

    /// Number of currently held locks
    pub fn held_locks(&self) -> usize {
        self.arena().held
    }

    /// Number of nodes in the tree, root included
    pub fn node_count(&self) -> usize {
        self.arena().live_nodes()
    }

    pub fn session(&self) -> Session {
        Session {
            tree: self.clone(),
            busy: Vec::new(),
        }
    }
}

fn display_path(path: &[Segment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter()
        .map(|s| s.as_deref().unwrap_or("null"))
        .collect::<Vec<_>>()
        .join("/")
}

struct LockHandle {
    arena: Arc<Mutex<Arena>>,
    node: usize,
    token: u64,
    path: String,
}

/// An acquired lock. Released on drop.
///
/// A lock for an operation with [`LockLevel::None`](crate::overseer::message::LockLevel::None)
/// is *free*: it holds nothing and never conflicts.
pub struct Lock {
    handle: Option<LockHandle>,
}

impl Lock {
    /// A lock that holds nothing.
    pub fn free() -> Self {
        Self { handle: None }
    }

    pub fn is_free(&self) -> bool {
        self.handle.is_none()
    }

    /// Locked path, `None` for a free lock.
    pub fn path(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.path.as_str())
    }

    /// Explicit release; same as dropping.
    pub fn unlock(self) {}
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let mut arena = handle.arena.lock().unwrap_or_else(PoisonError::into_inner);
            if !arena.unlock(handle.node, handle.token) {
                tracing::debug!("Lock on {} was already released", handle.path);
            }
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.handle {
            Some(h) => write!(f, "Lock({})", h.path),
            None => write!(f, "Lock(free)"),
        }
    }
}

/// Batch-scoped view of the tree.
///
/// When an acquisition fails inside a session, the path is remembered as busy.
/// Later requests in the same session that overlap a busy path are refused
/// without touching the tree, so a task further back in the queue cannot
/// overtake a blocked one on the same resource.
pub struct Session {
    tree: LockTree,
    busy: Vec<Vec<Segment>>,
}

impl Session {
    pub fn lock(&mut self, operation: OperationKind, key: &ResourceKey) -> Option<Lock> {
        let Some(depth) = operation.lock_level().depth() else {
            return Some(Lock::free());
        };
        let path: Vec<Segment> = key.segments()[..depth]
            .iter()
            .map(|s| s.map(str::to_string))
            .collect();

        if self.busy.iter().any(|b| overlaps(b, &path)) {
            return None;
        }
        let lock = self.tree.try_lock(&path);
        if lock.is_none() {
            self.busy.push(path);
        }
        lock
    }

    pub fn tree(&self) -> &LockTree {
        &self.tree
    }
}

/// One path is a prefix of the other.
fn overlaps(a: &[Segment], b: &[Segment]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(parts: &[&str]) -> Vec<Segment> {
        parts.iter().map(|p| Some(p.to_string())).collect()
    }

    #[test]
    fn test_ancestor_blocks_descendant() {
        let tree = LockTree::new();
        let coll = tree.try_lock(&path(&["collA"])).unwrap();
        assert!(tree.try_lock(&path(&["collA", "shard1"])).is_none());
        assert!(tree.try_lock(&path(&["collA", "shard1", "r1"])).is_none());

        drop(coll);
        assert!(tree.try_lock(&path(&["collA", "shard1"])).is_some());
    }

    #[test]
    fn test_descendant_blocks_ancestor() {
        let tree = LockTree::new();
        let shard = tree.try_lock(&path(&["collA", "shard1"])).unwrap();
        assert!(tree.try_lock(&path(&["collA"])).is_none());
        assert!(tree.try_lock(&[]).is_none());

        shard.unlock();
        assert!(tree.try_lock(&path(&["collA"])).is_some());
    }

    #[test]
    fn test_disjoint_paths_lock_in_parallel() {
        let tree = LockTree::new();
        let _a = tree.try_lock(&path(&["collA", "shard1"])).unwrap();
        let _b = tree.try_lock(&path(&["collA", "shard2"])).unwrap();
        let _c = tree.try_lock(&path(&["collB"])).unwrap();
        assert_eq!(tree.held_locks(), 3);
    }

    #[test]
    fn test_same_path_is_exclusive() {
        let tree = LockTree::new();
        let _a = tree.try_lock(&path(&["collA", "shard1", "r1"])).unwrap();
        assert!(tree.try_lock(&path(&["collA", "shard1", "r1"])).is_none());
        assert!(tree.try_lock(&path(&["collA", "shard1", "r2"])).is_some());
    }

    #[test]
    fn test_cluster_lock_blocks_everything() {
        let tree = LockTree::new();
        let cluster = tree.try_lock(&[]).unwrap();
        assert!(tree.try_lock(&path(&["collA"])).is_none());
        drop(cluster);
        assert!(tree.try_lock(&path(&["collA"])).is_some());
    }

    #[test]
    fn test_released_paths_are_pruned() {
        let tree = LockTree::new();
        let a = tree.try_lock(&path(&["collA", "shard1", "r1"])).unwrap();
        let b = tree.try_lock(&path(&["collB", "shard9"])).unwrap();
        assert_eq!(tree.node_count(), 6);

        // failed attempts leave nothing behind either
        assert!(tree.try_lock(&path(&["collA", "shard1"])).is_none());
        assert!(tree.try_lock(&path(&["collB", "shard9", "x", "y"])).is_none());
        assert_eq!(tree.node_count(), 6);

        drop(a);
        drop(b);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.held_locks(), 0);
    }

    #[test]
    fn test_absent_segment_is_its_own_key() {
        let tree = LockTree::new();
        let _none = tree.try_lock(&[Some("collA".into()), None]).unwrap();
        assert!(tree.try_lock(&path(&["collA", "shard1"])).is_some());
        assert!(tree.try_lock(&[Some("collA".into()), None]).is_none());
    }

    #[test]
    fn test_stale_lock_after_clear_does_not_release_new_holder() {
        let tree = LockTree::new();
        let old = tree.try_lock(&path(&["collA"])).unwrap();
        tree.clear();
        assert_eq!(tree.held_locks(), 0);

        let new = tree.try_lock(&path(&["collA"])).unwrap();
        drop(old);
        assert!(tree.try_lock(&path(&["collA"])).is_none());
        assert_eq!(tree.held_locks(), 1);
        drop(new);
        assert_eq!(tree.held_locks(), 0);
    }

    #[test]
    fn test_session_free_lock_for_unlocked_operations() {
        let tree = LockTree::new();
        let _cluster = tree.try_lock(&[]).unwrap();
        let mut session = tree.session();
        let lock = session
            .lock(OperationKind::OverseerStatus, &ResourceKey::default())
            .unwrap();
        assert!(lock.is_free());
    }

    #[test]
    fn test_session_truncates_to_lock_level() {
        let tree = LockTree::new();
        let mut session = tree.session();
        let key = ResourceKey::new("collA")
            .with_sub_unit("shard1")
            .with_member("r1");

        let lock = session.lock(OperationKind::Reload, &key).unwrap();
        assert_eq!(lock.path(), Some("collA"));
        drop(lock);

        let lock = session.lock(OperationKind::SplitShard, &key).unwrap();
        assert_eq!(lock.path(), Some("collA/shard1"));
        drop(lock);

        let lock = session.lock(OperationKind::AddReplicaProp, &key).unwrap();
        assert_eq!(lock.path(), Some("collA/shard1/r1"));
    }

    #[test]
    fn test_session_remembers_busy_paths() {
        let tree = LockTree::new();
        let mut session = tree.session();
        let shard1 = ResourceKey::new("collA").with_sub_unit("shard1");

        let held = session.lock(OperationKind::SplitShard, &shard1).unwrap();
        // collection-level attempt fails and marks collA busy
        assert!(session
            .lock(OperationKind::Reload, &ResourceKey::new("collA"))
            .is_none());

        drop(held);
        // shard2 is free in the tree, but collA is busy for this session
        let shard2 = ResourceKey::new("collA").with_sub_unit("shard2");
        assert!(session.lock(OperationKind::SplitShard, &shard2).is_none());

        // a fresh session sees the real tree
        let mut next = tree.session();
        assert!(next.lock(OperationKind::SplitShard, &shard2).is_some());
        assert!(next
            .lock(OperationKind::Reload, &ResourceKey::new("collB"))
            .is_some());
    }
}
