//! Operation result accumulator
//!
//! Results are an ordered JSON object. `success` and `failure` map a member
//! (`node_name/core`, or the node name for requests without a core) or async id to the raw member response or a
//! `{"message", "code"}` description. Handler errors caught by the dispatcher
//! land under `exception` with the same shape.

use crate::common::Error;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const SUCCESS: &str = "success";
pub const FAILURE: &str = "failure";
pub const EXCEPTION: &str = "exception";

/// `{message, code}` description of an error; code `-1` when none is known.
pub fn failure_description(message: impl Into<String>, code: Option<u16>) -> Value {
    json!({
        "message": message.into(),
        "code": code.map(i64::from).unwrap_or(-1),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OperationResult {
    entries: Map<String, Value>,
}

impl OperationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_success(&mut self, key: impl Into<String>, value: Value) {
        self.section_mut(SUCCESS).insert(key.into(), value);
    }

    pub fn add_failure(&mut self, key: impl Into<String>, value: Value) {
        self.section_mut(FAILURE).insert(key.into(), value);
    }

    /// Top-level entry outside of the success/failure sections.
    pub fn add(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn set_exception(&mut self, error: &Error) {
        self.entries.insert(
            EXCEPTION.to_string(),
            failure_description(error.to_string(), error.code()),
        );
    }

    fn section_mut(&mut self, name: &str) -> &mut Map<String, Value> {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("section was just set to an object"),
        }
    }

    fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.entries.get(name).and_then(Value::as_object)
    }

    pub fn success(&self) -> Option<&Map<String, Value>> {
        self.section(SUCCESS)
    }

    pub fn failure(&self) -> Option<&Map<String, Value>> {
        self.section(FAILURE)
    }

    pub fn exception(&self) -> Option<&Value> {
        self.entries.get(EXCEPTION)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn success_count(&self) -> usize {
        self.success().map_or(0, Map::len)
    }

    pub fn failure_count(&self) -> usize {
        self.failure().map_or(0, Map::len)
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0 || self.entries.contains_key("error")
    }

    /// Log or escalate failures recorded so far under `label`.
    pub fn check(&self, label: &str, failure_is_fatal: bool) -> crate::Result<()> {
        if !self.has_failures() {
            return Ok(());
        }
        let msg = format!(
            "Error: {}: {}",
            label,
            serde_json::to_string(&self.entries).unwrap_or_default()
        );
        if failure_is_fatal {
            Err(Error::Internal(msg))
        } else {
            tracing::error!("{}", msg);
            Ok(())
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.entries)
    }
}
