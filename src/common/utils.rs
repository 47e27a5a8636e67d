//! Utility functions for the overseer

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = match s.strip_suffix("ms") {
        Some(num) => (num, "ms"),
        None => {
            let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
            s.split_at(last)
        }
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs = |scale: u64| {
        num.checked_mul(scale)
            .map(std::time::Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration too large: {}", s)))
    };

    match unit {
        "ms" => Ok(std::time::Duration::from_millis(num)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3600),
        "d" => secs(86400),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a member-level async id from an operation's async prefix.
///
/// The suffix mixes wall-clock nanos with a random component so ids minted in
/// the same tick for different members never collide.
pub fn generate_async_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().gen();
    format!("{}{}{:08x}", prefix, nanos, salt)
}

/// Turn a live node name (`host:port_context`) into the member's base URL.
///
/// `10.0.0.1:8983_solr` becomes `http://10.0.0.1:8983/solr`; underscores inside
/// the context are path separators.
pub fn base_url_for_node_name(node_name: &str, scheme: &str) -> String {
    match node_name.split_once('_') {
        Some((host, context)) if !context.is_empty() => {
            format!("{}://{}/{}", scheme, host, context.replace('_', "/"))
        }
        Some((host, _)) => format!("{}://{}", scheme, host),
        None => format!("{}://{}", scheme, node_name),
    }
}
