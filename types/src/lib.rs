//! Shared types for the Relay Streamable HTTP server.
//!
//! This crate contains the JSON-RPC wire envelope and the protocol constants
//! shared by the server and its clients.

/// Default port for the Relay server.
pub const DEFAULT_PORT: u16 = 3000;

/// MCP protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the session identifier on requests and on the initialize response.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header carrying the last event id a reconnecting stream client has seen.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub mod jsonrpc;

// Re-export commonly used types
pub use jsonrpc::{
    EnvelopeError, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
