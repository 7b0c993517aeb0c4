//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Transport errors (server-defined range)
pub const SESSION_REQUIRED: i32 = -32000;
pub const SESSION_NOT_FOUND: i32 = -32001;
pub const SERVER_SHUTTING_DOWN: i32 = -32002;
pub const EVENTS_UNAVAILABLE: i32 = -32003;

/// JSON-RPC 2.0 Request.
///
/// A request without an `id` is a notification and expects no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with the given id.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Whether this message is a notification (no id).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Whether this is the session-opening `initialize` request.
    pub fn is_initialize(&self) -> bool {
        self.method == "initialize"
    }
}

/// JSON-RPC 2.0 Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Serialized as `null` when unknown, as JSON-RPC requires for parse errors.
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Create an error response with data.
    pub fn error_with_data(
        id: Option<Value>,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC 2.0 Error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated notification, delivered over the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Why a POST body could not be accepted as a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The body is not valid JSON.
    Parse(String),
    /// The body is JSON but not a single JSON-RPC 2.0 message.
    Invalid(String),
}

impl EnvelopeError {
    pub fn code(&self) -> i32 {
        match self {
            EnvelopeError::Parse(_) => PARSE_ERROR,
            EnvelopeError::Invalid(_) => INVALID_REQUEST,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EnvelopeError::Parse(msg) | EnvelopeError::Invalid(msg) => msg,
        }
    }
}

/// A classified client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A call that expects a response.
    Request(JsonRpcRequest),
    /// A call without an id.
    Notification(JsonRpcRequest),
    /// A client reply to a server-initiated request.
    Response(JsonRpcResponse),
}

impl IncomingMessage {
    /// Parse and classify a raw POST body.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| EnvelopeError::Parse(format!("Parse error: {}", e)))?;
        Self::from_value(value)
    }

    /// Classify an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let obj = match &value {
            Value::Object(obj) => obj,
            Value::Array(_) => {
                return Err(EnvelopeError::Invalid(
                    "Batch requests are not supported".to_string(),
                ))
            }
            _ => {
                return Err(EnvelopeError::Invalid(
                    "Invalid JSON-RPC 2.0 request".to_string(),
                ))
            }
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(EnvelopeError::Invalid(
                "Invalid JSON-RPC 2.0 request".to_string(),
            ));
        }

        if obj.contains_key("method") {
            let request: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|e| EnvelopeError::Invalid(format!("Invalid request: {}", e)))?;
            if request.is_notification() {
                Ok(IncomingMessage::Notification(request))
            } else {
                Ok(IncomingMessage::Request(request))
            }
        } else if obj.contains_key("result") || obj.contains_key("error") {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| EnvelopeError::Invalid(format!("Invalid response: {}", e)))?;
            Ok(IncomingMessage::Response(response))
        } else {
            Err(EnvelopeError::Invalid(
                "Invalid JSON-RPC 2.0 request".to_string(),
            ))
        }
    }

    /// Whether this message opens a new session.
    pub fn is_initialize(&self) -> bool {
        matches!(self, IncomingMessage::Request(req) if req.is_initialize())
    }

    /// The id to echo in an error response, if any.
    pub fn id(&self) -> Option<Value> {
        match self {
            IncomingMessage::Request(req) => req.id.clone(),
            IncomingMessage::Notification(_) => None,
            IncomingMessage::Response(resp) => resp.id.clone(),
        }
    }
}
