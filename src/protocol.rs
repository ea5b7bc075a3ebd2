//! JSON-RPC 2.0 wire types spoken with the SNAP daemon.
//!
//! Messages are bare JSON values on the stream, with no length prefix:
//!
//! ```text
//! --> {"jsonrpc":"2.0","method":"controller_nvme_create","id":1,"params":{"pci_func":5}}
//! <-- {"id":1,"result":"NvmeEmu0"}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol version tag carried by every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: u64,
    /// Omitted from the wire entirely when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request, dropping `params` when it carries nothing.
    ///
    /// `null`, `{}` and `[]` are treated as "no params" so the daemon never
    /// sees an empty `params` member.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            id,
            params: params.filter(|p| !is_empty_params(p)),
        }
    }
}

fn is_empty_params(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// A JSON-RPC 2.0 response.
///
/// `result` and `error` distinguish a missing member from an explicit
/// `null`: a response of `{"id":1,"result":null}` is a success with a null
/// value. `error` is kept as sent, whatever its shape; any response that
/// carries it is a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// `None` when the server could not tell which request failed.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    /// The `error` member as a standard error object, if it is one.
    pub fn structured_error(&self) -> Option<JsonRpcError> {
        self.error.as_ref().and_then(JsonRpcError::from_value)
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Parse an `error` payload; `None` unless it has an integer `code`
    /// and a string `message`.
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

/// Whether a decoded value is a server-initiated notification rather than
/// a response.
pub fn is_notification(value: &Value) -> bool {
    value.get("method").is_some() && value.get("id").is_none()
}
