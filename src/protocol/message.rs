//! JSON-RPC message envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A JSON-RPC request id. The protocol allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Read an id from a JSON value. `null`, floats and other shapes yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    /// Numeric view, used for ids the gateway allocated itself.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => u64::try_from(*n).ok(),
            RequestId::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        // Gateway-allocated ids come from a counter and never reach i64::MAX.
        RequestId::Number(id as i64)
    }
}

impl From<RequestId> for Value {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Number(n) => Value::from(n),
            RequestId::String(s) => Value::String(s),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Envelope classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and a non-null `id`; expects a response.
    Request,
    /// Has `method`, no `id`.
    Notification,
    /// Has `result` or `error`, no `method`.
    Response,
    /// Anything else (including non-objects).
    Invalid,
}

/// One decoded JSON-RPC message.
///
/// The payload is kept as an untyped JSON value so fields the gateway does
/// not understand pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRpcMessage(Value);

impl JsonRpcMessage {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Decode one message from text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Encode as compact single-line JSON.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn kind(&self) -> MessageKind {
        let Some(obj) = self.0.as_object() else {
            return MessageKind::Invalid;
        };
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        if obj.get("method").is_some_and(Value::is_string) {
            if has_id {
                MessageKind::Request
            } else {
                MessageKind::Notification
            }
        } else if obj.contains_key("result") || obj.contains_key("error") {
            MessageKind::Response
        } else {
            MessageKind::Invalid
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<RequestId> {
        self.0.get("id").and_then(RequestId::from_value)
    }

    /// Replace the `id` field. No-op on non-object payloads.
    pub fn set_id(&mut self, id: RequestId) {
        if let Some(obj) = self.0.as_object_mut() {
            obj.insert("id".to_string(), id.into());
        }
    }

    pub fn params(&self) -> Option<&Map<String, Value>> {
        self.0.get("params").and_then(Value::as_object)
    }

    pub fn params_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.0.get_mut("params").and_then(Value::as_object_mut)
    }

    /// The `result` member of a successful response.
    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    /// The `error` member of a failed response.
    pub fn error(&self) -> Option<&Value> {
        self.0.get("error")
    }

    pub fn request(id: RequestId, method: &str, params: Option<Value>) -> Self {
        let mut value = json!({
            "jsonrpc": "2.0",
            "id": Value::from(id),
            "method": method,
        });
        if let (Some(params), Some(obj)) = (params, value.as_object_mut()) {
            obj.insert("params".to_string(), params);
        }
        Self(value)
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        let mut value = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let (Some(params), Some(obj)) = (params, value.as_object_mut()) {
            obj.insert("params".to_string(), params);
        }
        Self(value)
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self(json!({
            "jsonrpc": "2.0",
            "id": Value::from(id),
            "result": result,
        }))
    }

    pub fn error_response(id: Option<RequestId>, code: i64, message: &str) -> Self {
        Self(json!({
            "jsonrpc": "2.0",
            "id": id.map(Value::from).unwrap_or(Value::Null),
            "error": { "code": code, "message": message },
        }))
    }
}

impl From<Value> for JsonRpcMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
