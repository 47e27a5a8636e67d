//! Admin HTTP API

use crate::common::Error;
use crate::overseer::cluster_state::ClusterState;
use crate::overseer::context::OverseerContext;
use crate::overseer::dispatcher::Dispatcher;
use crate::overseer::message::Message;
use crate::overseer::processor::OverseerHandle;
use crate::overseer::store::{async_marker_path, CoordinationStore};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct OverseerState {
    pub handle: OverseerHandle,
    pub dispatcher: Arc<Dispatcher>,
}

impl OverseerState {
    fn ctx(&self) -> &OverseerContext {
        self.dispatcher.context()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "msg": self.to_string(),
                "code": self.code().map(i64::from).unwrap_or(-1),
            }
        });
        (self.to_http_status(), Json(body)).into_response()
    }
}

/// Creates the admin router.
pub fn create_router(state: OverseerState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/admin/status", axum::routing::get(admin_status))
        // Operation submission
        .route("/admin/collections", axum::routing::post(submit_operation))
        // Inputs from the rest of the cluster
        .route("/admin/cluster-state", axum::routing::put(publish_cluster_state))
        .route("/admin/async-ids/:id", axum::routing::put(record_async_marker))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn admin_status(State(state): State<OverseerState>) -> impl IntoResponse {
    let ctx = state.ctx();
    Json(json!({
        "node_id": ctx.config.node_id,
        "started_at": state.handle.started_at().to_rfc3339(),
        "running_tasks": state.handle.running_tasks(),
        "blocked_tasks": state.handle.blocked_tasks(),
        "batches": state.handle.batches(),
        "held_locks": state.dispatcher.locks().tree().held_locks(),
        "cluster_version": ctx.cluster.current().version,
    }))
}

async fn submit_operation(
    State(state): State<OverseerState>,
    Json(props): Json<Map<String, Value>>,
) -> Result<Json<Value>, Error> {
    let message = Message::from_map(props)?;
    let results = state.handle.submit(message).await?;
    Ok(Json(results.into_value()))
}

async fn publish_cluster_state(
    State(state): State<OverseerState>,
    Json(cluster): Json<ClusterState>,
) -> impl IntoResponse {
    let cluster_state = &state.ctx().cluster;
    cluster_state.publish(cluster);
    let version = cluster_state.current().version;
    tracing::debug!("Published cluster state version {}", version);
    Json(json!({ "version": version }))
}

async fn record_async_marker(
    State(state): State<OverseerState>,
    Path(async_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let path = async_marker_path(&async_id);
    state.ctx().store.set_data(&path, body.to_vec(), None).await?;
    Ok(StatusCode::NO_CONTENT)
}
