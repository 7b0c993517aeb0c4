//! HTTP-facing transport errors.
//!
//! Every rejection is answered with a JSON-RPC error envelope so clients can
//! handle transport and protocol failures the same way.

use crate::mcp::{EventLogError, SessionError};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use relay_types::jsonrpc::{
    EVENTS_UNAVAILABLE, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, SERVER_SHUTTING_DOWN,
    SESSION_NOT_FOUND, SESSION_REQUIRED,
};
use relay_types::{EnvelopeError, JsonRpcResponse};
use serde_json::Value;

/// Methods served on the MCP endpoint.
pub const ALLOWED_METHODS: &str = "GET, POST, DELETE";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{}", .0.message())]
    Envelope(EnvelopeError),

    #[error("Bad Request: Mcp-Session-Id header is required")]
    SessionRequired,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Events(#[from] EventLogError),

    #[error("Invalid {0} header")]
    InvalidHeader(&'static str),

    #[error("Invalid origin")]
    Forbidden,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Method not found")]
    NotFound,

    #[error("Internal error")]
    Internal { id: Option<Value> },
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::Envelope(_)
            | TransportError::SessionRequired
            | TransportError::InvalidHeader(_) => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound | TransportError::NotFound => StatusCode::NOT_FOUND,
            TransportError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            TransportError::Events(EventLogError::Evicted { .. }) => StatusCode::CONFLICT,
            TransportError::Events(EventLogError::Ahead { .. }) => StatusCode::BAD_REQUEST,
            TransportError::Forbidden => StatusCode::FORBIDDEN,
            TransportError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            TransportError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            TransportError::Envelope(e) => e.code(),
            TransportError::SessionRequired => SESSION_REQUIRED,
            TransportError::SessionNotFound => SESSION_NOT_FOUND,
            TransportError::ShuttingDown => SERVER_SHUTTING_DOWN,
            TransportError::Events(EventLogError::Evicted { .. }) => EVENTS_UNAVAILABLE,
            TransportError::Events(EventLogError::Ahead { .. })
            | TransportError::InvalidHeader(_)
            | TransportError::Forbidden
            | TransportError::MethodNotAllowed => INVALID_REQUEST,
            TransportError::NotFound => METHOD_NOT_FOUND,
            TransportError::Internal { .. } => INTERNAL_ERROR,
        }
    }

    fn id(&self) -> Option<Value> {
        match self {
            TransportError::Internal { id } => id.clone(),
            _ => None,
        }
    }
}

impl From<SessionError> for TransportError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::EventLog(e) => TransportError::Events(e),
            SessionError::NotActive { .. } | SessionError::Gone { .. } => {
                TransportError::SessionNotFound
            }
            SessionError::DrainTimeout { .. } | SessionError::Serialization(_) => {
                TransportError::Internal { id: None }
            }
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = JsonRpcResponse::error(self.id(), self.code(), self.to_string());
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        }
        response
    }
}
