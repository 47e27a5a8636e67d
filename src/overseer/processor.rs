//! Admin task scheduler
//!
//! Tasks arrive on an unbounded queue. Every round of the loop is a new
//! [`TaskBatch`]: blocked tasks from earlier rounds go first, in queue order,
//! then newly arrived ones. A task that gets its lock runs on its own worker;
//! one that doesn't stays blocked until a later round. Rounds are triggered
//! by new work, by a finished task, or by the requeue backoff.

use crate::common::{Error, Result};
use crate::overseer::dispatcher::Dispatcher;
use crate::overseer::message::Message;
use crate::overseer::results::OperationResult;
use crate::overseer::task_locks::{RunningTasks, TaskBatch};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct QueuedTask {
    id: Uuid,
    message: Message,
    reply: oneshot::Sender<Result<OperationResult>>,
}

impl QueuedTask {
    fn respond(self, result: Result<OperationResult>) {
        if self.reply.send(result).is_err() {
            tracing::debug!("Submitter of task {} went away", self.id);
        }
    }
}

#[derive(Debug)]
struct ProcessorStats {
    started_at: DateTime<Utc>,
    blocked: AtomicUsize,
    batches: AtomicU64,
}

impl ProcessorStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            blocked: AtomicUsize::new(0),
            batches: AtomicU64::new(0),
        }
    }
}

/// Cloneable submission side of the scheduler.
#[derive(Clone)]
pub struct OverseerHandle {
    tx: mpsc::UnboundedSender<QueuedTask>,
    running: RunningTasks,
    stats: Arc<ProcessorStats>,
}

impl OverseerHandle {
    /// Queue `message` and wait for its result.
    pub async fn submit(&self, message: Message) -> Result<OperationResult> {
        let (reply, rx) = oneshot::channel();
        let task = QueuedTask {
            id: Uuid::new_v4(),
            message,
            reply,
        };
        tracing::debug!("Queueing task {} ({})", task.id, task.message.operation_name());
        self.tx.send(task).map_err(|_| Error::Interrupted)?;
        rx.await.map_err(|_| Error::Interrupted)?
    }

    pub fn running_tasks(&self) -> usize {
        self.running.count()
    }

    pub fn blocked_tasks(&self) -> usize {
        self.stats.blocked.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> u64 {
        self.stats.batches.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.stats.started_at
    }
}

pub struct TaskProcessor {
    dispatcher: Arc<Dispatcher>,
    rx: mpsc::UnboundedReceiver<QueuedTask>,
    running: RunningTasks,
    permits: Arc<Semaphore>,
    finished: Arc<Notify>,
    cancel: CancellationToken,
    backoff: Duration,
    stats: Arc<ProcessorStats>,
    blocked: VecDeque<QueuedTask>,
    batch_id: u64,
}

impl TaskProcessor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> (Self, OverseerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = &dispatcher.context().config;
        let running = RunningTasks::new();
        let stats = Arc::new(ProcessorStats::new());

        let processor = Self {
            permits: Arc::new(Semaphore::new(config.max_parallel_tasks)),
            backoff: config.requeue_backoff(),
            cancel: dispatcher.context().cancel.clone(),
            dispatcher,
            rx,
            running: running.clone(),
            finished: Arc::new(Notify::new()),
            stats: stats.clone(),
            blocked: VecDeque::new(),
            batch_id: 0,
        };
        let handle = OverseerHandle { tx, running, stats };
        (processor, handle)
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Task processor started");
        let mut closed = false;
        loop {
            if self.blocked.is_empty() {
                if closed {
                    break;
                }
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    next = self.rx.recv() => next,
                };
                match next {
                    Some(task) => self.blocked.push_back(task),
                    None => break,
                }
            }
            while let Ok(task) = self.rx.try_recv() {
                self.blocked.push_back(task);
            }

            self.run_batch();

            if !self.blocked.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = self.finished.notified() => {}
                    next = self.rx.recv(), if !closed => match next {
                        Some(task) => self.blocked.push_back(task),
                        None => closed = true,
                    },
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        self.stats.blocked.store(0, Ordering::SeqCst);
        for task in self.blocked.drain(..) {
            task.respond(Err(Error::Interrupted));
        }
        tracing::info!("Task processor stopped");
        Ok(())
    }

    /// One scheduling round over every waiting task.
    fn run_batch(&mut self) {
        self.batch_id += 1;
        self.stats.batches.fetch_add(1, Ordering::SeqCst);
        let batch = TaskBatch::new(self.batch_id, self.running.clone());

        let mut still_blocked = VecDeque::new();
        for task in self.blocked.drain(..) {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                still_blocked.push_back(task);
                continue;
            };
            let lock = match self.dispatcher.lock_task(&task.message, &batch) {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    tracing::debug!(
                        "Task {} blocked on {}",
                        task.id,
                        task.message.resource_key()
                    );
                    still_blocked.push_back(task);
                    continue;
                }
                Err(e) => {
                    let mut results = OperationResult::new();
                    results.set_exception(&e);
                    task.respond(Ok(results));
                    continue;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let finished = self.finished.clone();
            tokio::spawn(async move {
                let result = dispatcher.process(&task.message).await;
                drop(lock);
                drop(permit);
                finished.notify_one();
                task.respond(result);
            });
        }

        self.blocked = still_blocked;
        self.stats.blocked.store(self.blocked.len(), Ordering::SeqCst);
    }
}
