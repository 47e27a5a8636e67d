//! # overseer
//!
//! Coordination core of a sharded cluster's admin overseer:
//! - Hierarchical, non-blocking task locks (collection / shard / replica)
//! - Batch-scoped lock sessions so queued work keeps its order
//! - Concurrent fan-out of admin requests to members, with fan-in of results
//! - Async completion reconciliation through store markers and status queries
//! - Bounded waits for cluster state to converge
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   POST /admin/collections
//!             │
//! ┌───────────▼─────────────┐      ┌─────────────────┐
//! │     Task Processor      │─────▶│   Lock Tree     │
//! │ (batches, worker pool)  │      │ (task sessions) │
//! └───────────┬─────────────┘      └─────────────────┘
//!             │ message
//! ┌───────────▼─────────────┐      ┌─────────────────┐
//! │       Dispatcher        │─────▶│  State Waiter   │
//! │   (operation → command) │      │ (cluster state) │
//! └───────────┬─────────────┘      └─────────────────┘
//!             │ fan-out
//! ┌───────────▼─────────────┐      ┌─────────────────┐
//! │  Shard Request Tracker  │─────▶│ Async Reconciler│
//! └───┬─────────┬───────┬───┘      │ (store markers) │
//!     │         │       │          └─────────────────┘
//! ┌───▼───┐ ┌───▼───┐ ┌─▼─────┐
//! │Member │ │Member │ │Member │
//! └───────┘ └───────┘ └───────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! overseer serve --id overseer-1 --bind 0.0.0.0:5400
//!
//! # Publish cluster state, then submit an operation
//! curl -X PUT localhost:5400/admin/cluster-state -d @state.json \
//!   -H 'content-type: application/json'
//! curl -X POST localhost:5400/admin/collections \
//!   -H 'content-type: application/json' \
//!   -d '{"operation": "reload", "collection": "books"}'
//! ```

pub mod common;
pub mod overseer;

// Re-export commonly used types
pub use common::{Error, OverseerConfig, Result};
pub use overseer::{Dispatcher, Message, OperationKind, OperationResult, Overseer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
