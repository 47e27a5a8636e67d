//! Request dispatcher
//!
//! Resolves a message to its registered [`Command`], runs it against the
//! latest cluster state, and folds every error except cancellation into the
//! `exception` entry of the result.

use crate::common::{Error, Result};
use crate::overseer::commands::{builtin_commands, Command};
use crate::overseer::context::OverseerContext;
use crate::overseer::message::{Message, OperationKind, REPLICA, SHARD};
use crate::overseer::results::OperationResult;
use crate::overseer::task_locks::{TaskBatch, TaskLock, TaskLocks};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;

pub struct DispatcherBuilder {
    ctx: Arc<OverseerContext>,
    commands: HashMap<OperationKind, Arc<dyn Command>>,
}

impl DispatcherBuilder {
    /// Register `command` for `operation`, replacing any earlier registration.
    pub fn register(mut self, operation: OperationKind, command: Arc<dyn Command>) -> Self {
        self.commands.insert(operation, command);
        self
    }

    pub fn with_builtin_commands(mut self) -> Self {
        for (operation, command) in builtin_commands() {
            self.commands.insert(operation, command);
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        tracing::info!("Dispatcher ready with {} commands", self.commands.len());
        Dispatcher {
            ctx: self.ctx,
            commands: self.commands,
            locks: TaskLocks::new(),
        }
    }
}

pub struct Dispatcher {
    ctx: Arc<OverseerContext>,
    commands: HashMap<OperationKind, Arc<dyn Command>>,
    locks: TaskLocks,
}

impl Dispatcher {
    pub fn builder(ctx: Arc<OverseerContext>) -> DispatcherBuilder {
        DispatcherBuilder {
            ctx,
            commands: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<OverseerContext> {
        &self.ctx
    }

    pub fn locks(&self) -> &TaskLocks {
        &self.locks
    }

    pub fn is_registered(&self, operation: OperationKind) -> bool {
        self.commands.contains_key(&operation)
    }

    /// Lock the resource `message` targets for `batch`; see [`TaskLocks::lock_task`].
    pub fn lock_task(&self, message: &Message, batch: &TaskBatch) -> Result<Option<TaskLock>> {
        self.locks.lock_task(message, batch)
    }

    /// Run one message to completion.
    ///
    /// Always returns a result except on cancellation, which comes back as
    /// [`Error::Interrupted`].
    pub async fn process(&self, message: &Message) -> Result<OperationResult> {
        let collection = message.task_key();
        let span = tracing::info_span!(
            "overseer_op",
            operation = message.operation_name(),
            collection = collection.as_deref().unwrap_or(""),
            shard = message.get_str(SHARD).as_deref().unwrap_or(""),
            replica = message.get_str(REPLICA).as_deref().unwrap_or(""),
        );

        async move {
            tracing::debug!("Processing message {:?}", message.properties());
            let mut results = OperationResult::new();
            match self.invoke(message, &mut results).await {
                Ok(()) => {}
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    match &collection {
                        Some(c) => tracing::error!(
                            "Collection: {}, operation: {} failed: {}",
                            c,
                            message.operation_name(),
                            e
                        ),
                        None => tracing::error!(
                            "Operation: {} failed: {}",
                            message.operation_name(),
                            e
                        ),
                    }
                    results.set_exception(&e);
                }
            }
            Ok(results)
        }
        .instrument(span)
        .await
    }

    async fn invoke(&self, message: &Message, results: &mut OperationResult) -> Result<()> {
        let operation = message.operation()?;
        let command = self
            .commands
            .get(&operation)
            .ok_or_else(|| Error::UnknownOperation(operation.to_string()))?;
        let state = self.ctx.cluster.current();
        command.call(&self.ctx, &state, message, results).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::OverseerConfig;
    use crate::overseer::cluster_state::{ClusterState, ClusterStateCache};
    use crate::overseer::message::COLLECTION;
    use crate::overseer::mock::MockMemberClient;
    use crate::overseer::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Failing(fn() -> Error);

    #[async_trait]
    impl Command for Failing {
        async fn call(
            &self,
            _ctx: &OverseerContext,
            _state: &ClusterState,
            _message: &Message,
            results: &mut OperationResult,
        ) -> Result<()> {
            results.add_success("n1", json!({"status": 0}));
            Err((self.0)())
        }
    }

    fn context() -> Arc<OverseerContext> {
        Arc::new(OverseerContext::new(
            OverseerConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(ClusterStateCache::default()),
            Arc::new(MockMemberClient::ok()),
        ))
    }

    #[tokio::test]
    async fn test_unregistered_operation_becomes_exception() {
        let dispatcher = Dispatcher::builder(context()).build();
        let msg = Message::new(OperationKind::Backup).with(COLLECTION, "c1");
        let results = dispatcher.process(&msg).await.unwrap();
        let exception = results.exception().unwrap();
        assert_eq!(exception["code"], json!(400));
        assert!(exception["message"].as_str().unwrap().contains("backup"));
    }

    #[tokio::test]
    async fn test_unknown_operation_name() {
        let dispatcher = Dispatcher::builder(context()).with_builtin_commands().build();
        let msg = Message::from_map(json!({"operation": "explode"}).as_object().cloned().unwrap())
            .unwrap();
        let results = dispatcher.process(&msg).await.unwrap();
        assert!(results.exception().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("explode"));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_partial_results() {
        let dispatcher = Dispatcher::builder(context())
            .register(
                OperationKind::Backup,
                Arc::new(Failing(|| Error::Other("disk full".into()))),
            )
            .build();
        let msg = Message::new(OperationKind::Backup).with(COLLECTION, "c1");
        let results = dispatcher.process(&msg).await.unwrap();
        assert_eq!(results.success_count(), 1);
        assert_eq!(
            results.exception().unwrap(),
            &json!({"message": "disk full", "code": -1})
        );
    }

    #[tokio::test]
    async fn test_interrupt_propagates() {
        let dispatcher = Dispatcher::builder(context())
            .register(OperationKind::Backup, Arc::new(Failing(|| Error::Interrupted)))
            .build();
        let msg = Message::new(OperationKind::Backup).with(COLLECTION, "c1");
        assert!(dispatcher.process(&msg).await.unwrap_err().is_interrupted());
    }

    #[test]
    fn test_builtin_registration() {
        let dispatcher = Dispatcher::builder(context()).with_builtin_commands().build();
        assert!(dispatcher.is_registered(OperationKind::Reload));
        assert!(dispatcher.is_registered(OperationKind::MockShardTask));
        assert!(!dispatcher.is_registered(OperationKind::Create));
    }
}
