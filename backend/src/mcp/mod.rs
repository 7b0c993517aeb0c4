//! MCP (Model Context Protocol) Streamable HTTP sessions.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - Send a JSON-RPC message
//! - `GET /mcp` - Open the SSE stream for server messages (resumable with `Last-Event-ID`)
//! - `DELETE /mcp` - Terminate session
//!
//! ## Session Management
//!
//! Sessions are identified by the `Mcp-Session-Id` header, assigned during
//! initialization and required for subsequent requests. Every server-initiated
//! message is appended to the session's [`EventLog`] before delivery, so a
//! reconnecting stream resumes without gaps or duplicates.

pub mod event_log;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod tools;

pub use event_log::{EventLog, EventLogError, LogEntry};
pub use handler::{McpHandler, ProtocolEngine};
pub use lifecycle::{LifecycleCoordinator, ShutdownReport};
pub use registry::SessionRegistry;
pub use session::{Session, SessionError, SessionHandle, SessionState};
pub use tools::{resource_contents, text_result, Resource, ResourceRegistry, Tool, ToolRegistry};
