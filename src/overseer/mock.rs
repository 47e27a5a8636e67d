//! Scripted member client for tests and local runs

use crate::overseer::transport::{MemberClient, RemoteError, ShardRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

type Responder = dyn Fn(&ShardRequest) -> Result<Value, RemoteError> + Send + Sync;

/// Member client that answers every request through a closure and keeps a log
/// of what it was sent.
pub struct MockMemberClient {
    responder: Box<Responder>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<ShardRequest>>,
}

impl MockMemberClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ShardRequest) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delays: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request succeeds with `{"status": 0}`.
    pub fn ok() -> Self {
        Self::new(|_| Ok(json!({"status": 0})))
    }

    /// Delay answers from `node_name`.
    pub fn with_delay(mut self, node_name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(node_name.into(), delay);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ShardRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests_to(&self, node_name: &str) -> Vec<ShardRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.node_name == node_name)
            .collect()
    }
}

#[async_trait]
impl MemberClient for MockMemberClient {
    async fn send(&self, request: &ShardRequest) -> Result<Value, RemoteError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(delay) = self.delays.get(&request.node_name) {
            tokio::time::sleep(*delay).await;
        }
        (self.responder)(request)
    }
}
