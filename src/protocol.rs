//! Wire types for the JSON Lines coordination protocol.
//!
//! Every request and response is a single JSON object terminated by `\n`:
//! `{"version":1,"op":"create","path":"/a","data":[1]}\n`

use serde::{Deserialize, Serialize};

/// Protocol version, included in every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Create a node; the parent must exist.
    Create,
    /// Read a node's data.
    Get,
    /// Overwrite a node's data.
    Set,
    /// Delete a childless node.
    Delete,
    /// Check whether a node exists.
    Exists,
    /// List a node's child names.
    Children,
    /// Liveness check.
    Ping,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version (must be [`PROTOCOL_VERSION`]).
    pub version: u32,
    /// Requested operation.
    pub op: Op,
    /// Absolute node path. Empty for `ping`.
    #[serde(default)]
    pub path: String,
    /// Node payload (for `create` and `set`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl Request {
    /// Builds a request for `op` on `path`.
    pub fn new(op: Op, path: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            op,
            path: path.into(),
            data: None,
        }
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = Some(data.to_vec());
        self
    }

    /// Serializes to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self).map(|json| format!("{}\n", json))
    }
}

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The node (or its parent, for create) does not exist.
    NoNode,
    /// A node already exists at the path.
    NodeExists,
    /// The node still has children.
    NotEmpty,
    /// Malformed request or path.
    BadRequest,
    /// The server is at its connection limit.
    TooManyConnections,
}

/// Response envelope from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version.
    pub version: u32,
    /// Whether the request succeeded.
    pub ok: bool,
    /// Error message when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Operation-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Creates a success response with optional data payload.
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ok: true,
            error: None,
            code: None,
            data,
        }
    }

    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ok: false,
            error: Some(message.into()),
            code: Some(code),
            data: None,
        }
    }

    /// Serializes to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self).map(|json| format!("{}\n", json))
    }
}
