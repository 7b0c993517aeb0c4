//! MCP JSON-RPC request handler.
//!
//! The transport hands every request it accepts to a [`ProtocolEngine`]. The
//! built-in [`McpHandler`] implements the MCP lifecycle methods, dispatches
//! `tools/call` to the tools registered with it, and serves `resources/read`
//! from its registered resources.

use crate::mcp::session::{SessionHandle, SessionState};
use crate::mcp::tools::{resource_contents, Resource, ResourceRegistry, Tool, ToolRegistry};
use async_trait::async_trait;
use relay_types::jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
use relay_types::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Dispatches JSON-RPC requests for a session.
#[async_trait]
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Handle one request or notification.
    ///
    /// Returns `None` for notifications. `Err` is an internal failure; the
    /// transport answers it with a generic internal error.
    async fn handle(
        &self,
        session: SessionHandle,
        request: JsonRpcRequest,
    ) -> anyhow::Result<Option<JsonRpcResponse>>;
}

/// Tool call parameters from MCP.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReadResourceParams {
    uri: String,
}

/// Built-in MCP request handler.
pub struct McpHandler {
    name: String,
    version: String,
    instructions: Option<String>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
}

impl McpHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            tools: ToolRegistry::new(),
            resources: ResourceRegistry::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Instructions returned to the client in the initialize result.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn with_resource(mut self, resource: impl Resource + 'static) -> Self {
        self.resources.register(resource);
        self
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Handle the initialize request.
    fn handle_initialize(&self, session: &SessionHandle, id: Option<Value>) -> JsonRpcResponse {
        if session.state() != SessionState::Uninitialized {
            warn!(
                "MCP: Rejecting repeated initialize on session {}",
                session.session_id()
            );
            return JsonRpcResponse::error(id, INVALID_REQUEST, "Session already initialized");
        }

        let mut result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {},
                "resources": {}
            },
            "serverInfo": {
                "name": self.name,
                "version": self.version
            }
        });
        if let Some(instructions) = &self.instructions {
            result["instructions"] = json!(instructions);
        }
        JsonRpcResponse::success(id, result)
    }

    /// Handle a tools/call request.
    async fn handle_call_tool(
        &self,
        session: SessionHandle,
        id: Option<Value>,
        params: Value,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
        };

        let Some(tool) = self.tools.get(&params.name) else {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                format!("Unknown tool: {}", params.name),
            );
        };

        info!(
            "MCP: Calling tool '{}' for session {}",
            params.name,
            session.session_id()
        );
        let arguments = params.arguments.unwrap_or(json!({}));
        match tool.call(session, arguments).await {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                warn!("MCP: Tool '{}' failed: {}", params.name, e);
                JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Tool call failed: {}", e))
            }
        }
    }

    /// Handle a resources/read request.
    async fn handle_read_resource(
        &self,
        session: SessionHandle,
        id: Option<Value>,
        params: Value,
    ) -> JsonRpcResponse {
        let params: ReadResourceParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
        };

        let Some((resource, variables)) = self.resources.resolve(&params.uri) else {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                format!("Unknown resource: {}", params.uri),
            );
        };

        debug!(
            "MCP: Reading resource {} for session {}",
            params.uri,
            session.session_id()
        );
        match resource.read(session, &params.uri, variables).await {
            Ok(text) => JsonRpcResponse::success(
                id,
                resource_contents(&params.uri, resource.mime_type(), text),
            ),
            Err(e) => {
                warn!("MCP: Reading resource {} failed: {}", params.uri, e);
                JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Resource read failed: {}", e))
            }
        }
    }
}

#[async_trait]
impl ProtocolEngine for McpHandler {
    async fn handle(
        &self,
        session: SessionHandle,
        request: JsonRpcRequest,
    ) -> anyhow::Result<Option<JsonRpcResponse>> {
        let id = request.id.clone();
        debug!(
            "MCP: Handling method {} for session {}",
            request.method,
            session.session_id()
        );

        let response = match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(&session, id)),
            "notifications/initialized" | "notifications/cancelled" => None,
            "ping" => Some(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "tools": self.tools.descriptors() }),
            )),
            "tools/call" => Some(
                self.handle_call_tool(session, id, request.params.unwrap_or(json!({})))
                    .await,
            ),
            "resources/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "resources": self.resources.descriptors() }),
            )),
            "resources/templates/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "resourceTemplates": self.resources.template_descriptors() }),
            )),
            "resources/read" => Some(
                self.handle_read_resource(session, id, request.params.unwrap_or(json!({})))
                    .await,
            ),
            _ if request.is_notification() => {
                debug!("MCP: Ignoring notification {}", request.method);
                None
            }
            _ => Some(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        };
        Ok(response)
    }
}
