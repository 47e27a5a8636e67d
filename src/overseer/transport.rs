//! Member admin transport
//!
//! [`MemberClient`] sends one admin request to one member. [`ShardHandler`]
//! runs a fan-out's requests concurrently and hands back responses in
//! completion order.

use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Member-side action
pub const ACTION: &str = "action";
/// Core the request applies to
pub const CORE: &str = "core";
/// Admin handler path on the member
pub const QT: &str = "qt";
/// Async id queried by a status request
pub const REQUEST_ID: &str = "requestid";

/// Request parameters. Each in-flight request owns its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a request is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Admin,
    StatusQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRequest {
    /// Member the request is addressed to (live node name)
    pub node_name: String,
    pub base_url: String,
    /// Sub-unit the request belongs to, if any
    pub shard: Option<String>,
    pub params: Params,
    pub purpose: Purpose,
}

impl ShardRequest {
    pub fn async_id(&self) -> Option<&str> {
        self.params.get(crate::overseer::message::ASYNC)
    }
}

/// Error reported for a member request.
///
/// `code` is the member's response code; `None` means no response arrived at
/// all (connection refused, timeout, ...). `root_cause` names the member-side
/// error class and is what allow-lists match against.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub code: Option<u16>,
    pub root_cause: Option<String>,
}

impl RemoteError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            root_cause: None,
        }
    }

    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
            root_cause: None,
        }
    }

    pub fn with_root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = Some(root_cause.into());
        self
    }

    /// Build from a member error body: `{"error": {"msg", "code", "root_cause"}}`.
    pub fn from_error_body(status: u16, body: &Value) -> Self {
        let error = &body["error"];
        let message = error["msg"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("member returned status {}", status));
        let code = error["code"]
            .as_u64()
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(status);
        Self {
            message,
            code: Some(code),
            root_cause: error["root_cause"].as_str().map(str::to_string),
        }
    }

    /// `{message, code}` description recorded in results
    pub fn to_value(&self) -> Value {
        json!({
            "message": self.message,
            "code": self.code.map(i64::from).unwrap_or(-1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShardResponse {
    pub node_name: String,
    pub shard: Option<String>,
    /// Core the request addressed, if any
    pub core: Option<String>,
    pub async_id: Option<String>,
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl ShardResponse {
    /// Key under which this response is recorded. Several cores can live on
    /// one node, so the core is part of the key when the request named one.
    pub fn result_key(&self) -> String {
        match &self.core {
            Some(core) => format!("{}/{}", self.node_name, core),
            None => self.node_name.clone(),
        }
    }
}

#[async_trait]
pub trait MemberClient: Send + Sync {
    async fn send(&self, request: &ShardRequest) -> std::result::Result<Value, RemoteError>;
}

/// Member client speaking JSON over HTTP.
pub struct HttpMemberClient {
    http: reqwest::Client,
}

impl HttpMemberClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    fn url(request: &ShardRequest) -> String {
        let path = request.params.get(QT).unwrap_or("");
        format!("{}{}", request.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl MemberClient for HttpMemberClient {
    async fn send(&self, request: &ShardRequest) -> std::result::Result<Value, RemoteError> {
        let url = Self::url(request);
        let response = self
            .http
            .get(&url)
            .query(&request.params)
            .send()
            .await
            .map_err(|e| RemoteError::unreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        let body = response.json::<Value>().await;
        if status.is_success() {
            body.map_err(|e| {
                RemoteError::remote(
                    status.as_u16(),
                    format!("{}: undecodable response: {}", url, e),
                )
            })
        } else {
            Err(RemoteError::from_error_body(
                status.as_u16(),
                &body.unwrap_or(Value::Null),
            ))
        }
    }
}

/// Concurrent requests of one fan-out.
pub struct ShardHandler {
    client: Arc<dyn MemberClient>,
    pending: JoinSet<ShardResponse>,
}

impl ShardHandler {
    pub fn new(client: Arc<dyn MemberClient>) -> Self {
        Self {
            client,
            pending: JoinSet::new(),
        }
    }

    pub fn submit(&mut self, request: ShardRequest) {
        let client = self.client.clone();
        self.pending.spawn(async move {
            let outcome = AssertUnwindSafe(client.send(&request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(RemoteError::unreachable(format!(
                        "request to {} panicked",
                        request.node_name
                    )))
                });
            ShardResponse {
                async_id: request.async_id().map(str::to_string),
                core: request.params.get(CORE).map(str::to_string),
                node_name: request.node_name,
                shard: request.shard,
                outcome,
            }
        });
    }

    /// Next finished request, or `None` once nothing is in flight.
    pub async fn take_completed_or_error(&mut self) -> Option<ShardResponse> {
        loop {
            match self.pending.join_next().await? {
                Ok(response) => return Some(response),
                Err(e) => tracing::debug!("Member request task ended without a response: {}", e),
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Abort everything still in flight.
    pub fn cancel_all(&mut self) {
        self.pending.abort_all();
    }
}
