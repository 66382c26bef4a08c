//! Wire types for mpv's line-delimited JSON IPC.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One request line: `{"command": [...], "request_id": N}`.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: u64,
}

impl MpvCommand {
  /// Wrap raw command arguments, assigning a process-wide unique request id.
  pub fn new(command: Vec<Value>) -> Self {
    Self {
      command,
      request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
    }
  }

  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  pub fn set_property(name: &str, value: Value) -> Self {
    Self::new(vec!["set_property".into(), name.into(), value])
  }

  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }
}

/// Reply to a request. `error` is `"success"` or mpv's failure text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvResponse {
  pub error: String,
  #[serde(default)]
  pub data: Option<Value>,
  pub request_id: u64,
}

impl MpvResponse {
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }

  /// The reply's data, or mpv's error text.
  pub fn into_result(self) -> Result<Option<Value>, String> {
    if self.is_success() {
      Ok(self.data)
    } else {
      Err(self.error)
    }
  }
}

/// A decoded input line.
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  /// Unsolicited notification, by name. Playback state is polled, so the body is dropped.
  Event(String),
}

impl MpvMessage {
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("request_id").is_some_and(|id| !id.is_null()) {
      return serde_json::from_value(value).map(MpvMessage::Response);
    }
    let name = value
      .get("event")
      .and_then(Value::as_str)
      .unwrap_or("unknown")
      .to_string();
    Ok(MpvMessage::Event(name))
  }
}

/// Scalar view of a property's JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Bool(bool),
  Number(f64),
  String(String),
  /// Arrays and objects, as JSON text.
  Json(String),
  Null,
}

impl PropertyValue {
  pub fn as_f64_or(&self, default: f64) -> f64 {
    match self {
      PropertyValue::Number(n) => *n,
      _ => default,
    }
  }

  pub fn as_bool_or(&self, default: bool) -> bool {
    match self {
      PropertyValue::Bool(b) => *b,
      _ => default,
    }
  }
}

impl From<Value> for PropertyValue {
  fn from(value: Value) -> Self {
    match value {
      Value::Null => PropertyValue::Null,
      Value::Bool(b) => PropertyValue::Bool(b),
      Value::Number(n) => n.as_f64().map_or(PropertyValue::Null, PropertyValue::Number),
      Value::String(s) => PropertyValue::String(s),
      other => PropertyValue::Json(other.to_string()),
    }
  }
}
