//! Overseer coordination core
//!
//! The overseer is responsible for:
//! - Serializing admin operations per resource (hierarchical lock tree)
//! - Dispatching each operation to its command
//! - Fanning requests out to members and collecting the responses
//! - Reconciling asynchronous member work through completion markers
//! - Waiting for cluster state to reflect submitted changes

pub mod cluster_state;
pub mod commands;
pub mod context;
pub mod dispatcher;
pub mod http;
pub mod lock_tree;
pub mod message;
pub mod mock;
pub mod processor;
pub mod reconciler;
pub mod results;
pub mod server;
pub mod store;
pub mod task_locks;
pub mod tracker;
pub mod transport;
pub mod waiter;

pub use cluster_state::{ClusterState, ClusterStateCache, Member, MemberState, ResourceState, SubUnit};
pub use commands::Command;
pub use context::OverseerContext;
pub use dispatcher::Dispatcher;
pub use lock_tree::{Lock, LockTree};
pub use message::{LockLevel, Message, OperationKind, ResourceKey};
pub use processor::{OverseerHandle, TaskProcessor};
pub use results::OperationResult;
pub use server::Overseer;
pub use store::{CoordinationStore, InMemoryStore, StateUpdateQueue};
pub use task_locks::{TaskBatch, TaskLocks};
pub use tracker::ShardRequestTracker;
pub use transport::{HttpMemberClient, MemberClient};
