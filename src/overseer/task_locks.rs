//! Batch-scoped task locking
//!
//! The scheduler hands every processing round a [`TaskBatch`]. All locks taken
//! while that batch is current go through one [`Session`]; a new batch id
//! replaces the session, and when nothing is running at that moment the whole
//! tree is cleared so a leaked lock cannot wedge a resource forever.
//!
//! Batch transition, the running-task check and lock acquisition all happen
//! under one mutex, and a granted lock registers its task as running before the
//! mutex is released. A task therefore can never hold a lock while the counter
//! still reads zero, which is what would let a batch change wipe it.

use crate::overseer::lock_tree::{Lock, LockTree, Session};
use crate::overseer::message::{Message, OperationKind};
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Count of tasks currently holding a lock and running.
#[derive(Debug, Clone, Default)]
pub struct RunningTasks {
    count: Arc<AtomicUsize>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn enter(&self) -> RunningGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        RunningGuard {
            count: self.count.clone(),
        }
    }
}

#[derive(Debug)]
struct RunningGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One processing round of the scheduler.
#[derive(Debug, Clone)]
pub struct TaskBatch {
    id: u64,
    running: RunningTasks,
}

impl TaskBatch {
    pub fn new(id: u64, running: RunningTasks) -> Self {
        Self { id, running }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn running_tasks(&self) -> usize {
        self.running.count()
    }
}

/// A granted task lock. Dropping it releases the lock, then marks the task
/// as no longer running.
#[derive(Debug)]
pub struct TaskLock {
    lock: Lock,
    _running: RunningGuard,
}

impl TaskLock {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

struct SessionSlot {
    batch_id: u64,
    session: Session,
}

/// Lock tree plus the session of the current batch.
pub struct TaskLocks {
    tree: LockTree,
    current: Mutex<Option<SessionSlot>>,
}

impl Default for TaskLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLocks {
    pub fn new() -> Self {
        Self {
            tree: LockTree::new(),
            current: Mutex::new(None),
        }
    }

    pub fn tree(&self) -> &LockTree {
        &self.tree
    }

    /// Try to lock the resource a message targets on behalf of `batch`.
    ///
    /// `Ok(None)` means the resource is busy and the task should be retried in
    /// a later batch. An unknown operation is an error.
    pub fn lock_task(&self, message: &Message, batch: &TaskBatch) -> Result<Option<TaskLock>> {
        let operation = message.operation()?;
        Ok(self.lock_operation(operation, message, batch))
    }

    fn lock_operation(
        &self,
        operation: OperationKind,
        message: &Message,
        batch: &TaskBatch,
    ) -> Option<TaskLock> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let stale = current.as_ref().map_or(true, |s| s.batch_id != batch.id());
        if stale {
            if batch.running_tasks() == 0 {
                self.tree.clear();
            }
            tracing::debug!("Starting lock session for batch {}", batch.id());
            *current = Some(SessionSlot {
                batch_id: batch.id(),
                session: self.tree.session(),
            });
        }

        let slot = current.as_mut()?;
        let lock = slot.session.lock(operation, &message.resource_key())?;
        Some(TaskLock {
            lock,
            _running: batch.running.enter(),
        })
    }
}
