//! Common utilities and types shared across the overseer

pub mod config;
pub mod error;
pub mod utils;

pub use config::OverseerConfig;
pub use error::{Error, Result};
pub use utils::{base_url_for_node_name, generate_async_id, parse_duration, timestamp_now_millis};
