//! Overseer server

use crate::common::{OverseerConfig, Result};
use crate::overseer::cluster_state::ClusterStateCache;
use crate::overseer::context::OverseerContext;
use crate::overseer::dispatcher::Dispatcher;
use crate::overseer::http::{create_router, OverseerState};
use crate::overseer::processor::TaskProcessor;
use crate::overseer::store::InMemoryStore;
use crate::overseer::transport::HttpMemberClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Overseer {
    config: OverseerConfig,
    shutdown: CancellationToken,
}

impl Overseer {
    pub fn new(config: OverseerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        tracing::info!("Starting overseer: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Admin path: {}", self.config.admin_path);
        tracing::info!("  Max parallel tasks: {}", self.config.max_parallel_tasks);

        let client = Arc::new(HttpMemberClient::new(self.config.member_request_timeout())?);
        let ctx = Arc::new(
            OverseerContext::new(
                self.config.clone(),
                Arc::new(InMemoryStore::new()),
                Arc::new(ClusterStateCache::default()),
                client,
            )
            .with_cancel(self.shutdown.clone()),
        );

        let dispatcher = Arc::new(Dispatcher::builder(ctx).with_builtin_commands().build());
        let (processor, handle) = TaskProcessor::new(dispatcher.clone());
        let processor = tokio::spawn(processor.run());

        let router = create_router(OverseerState { handle, dispatcher });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Overseer ready");

        let shutdown = self.shutdown.clone();
        let http_server = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
            }
        }

        self.shutdown.cancel();
        match processor.await {
            Ok(res) => res?,
            Err(e) => tracing::error!("Task processor panicked: {}", e),
        }
        tracing::info!("Overseer stopped");
        Ok(())
    }
}
