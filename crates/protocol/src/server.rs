//! Server → Client responses

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response written back on the control socket.
///
/// Successful responses carry their payload as top-level fields next to
/// `ok`; failures carry a human-readable `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ControlResponse {
    pub fn success(id: Option<String>) -> Self {
        Self {
            ok: true,
            id,
            error: None,
            payload: Map::new(),
        }
    }

    pub fn failure(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            error: Some(error.into()),
            payload: Map::new(),
        }
    }

    /// Attach a payload field. Values that fail to serialize become `null`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Single-line JSON encoding terminated by `\n`.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"failed to encode response"}"#.to_string());
        line.push('\n');
        line
    }
}
