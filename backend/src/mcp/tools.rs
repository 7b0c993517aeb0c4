//! Pluggable MCP tools and resources.

use crate::mcp::session::SessionHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A tool callable through `tools/call`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool arguments.
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// Run the tool. `session` can push notifications to the caller's stream.
    async fn call(&self, session: SessionHandle, arguments: Value) -> anyhow::Result<Value>;
}

/// Tools known to an engine, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool descriptors for a `tools/list` result.
    pub fn descriptors(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect()
    }
}

/// Wrap plain text as an MCP tool result.
pub fn text_result(text: impl Into<String>) -> Value {
    json!({
        "content": [
            { "type": "text", "text": text.into() }
        ]
    })
}

/// A resource readable through `resources/read`.
///
/// `uri_template` is either a fixed URI or a template with `{name}`
/// placeholders, such as `relay://notes/{topic}/{id}`. A placeholder matches
/// one non-empty path segment.
#[async_trait]
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    fn uri_template(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn mime_type(&self) -> &str {
        "application/json"
    }

    /// Read the resource at `uri`. `variables` holds the placeholder values.
    async fn read(
        &self,
        session: SessionHandle,
        uri: &str,
        variables: BTreeMap<String, String>,
    ) -> anyhow::Result<String>;
}

/// Resources known to an engine, keyed by name.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource, replacing any resource with the same name.
    pub fn register(&mut self, resource: impl Resource + 'static) {
        self.resources
            .insert(resource.name().to_string(), Arc::new(resource));
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Find the resource serving `uri` and the values of its placeholders.
    pub fn resolve(&self, uri: &str) -> Option<(Arc<dyn Resource>, BTreeMap<String, String>)> {
        self.resources.values().find_map(|resource| {
            match_template(resource.uri_template(), uri)
                .map(|variables| (Arc::clone(resource), variables))
        })
    }

    /// Fixed-URI resources for a `resources/list` result.
    pub fn descriptors(&self) -> Vec<Value> {
        self.resources
            .values()
            .filter(|r| !is_template(r.uri_template()))
            .map(|r| {
                json!({
                    "uri": r.uri_template(),
                    "name": r.name(),
                    "description": r.description(),
                    "mimeType": r.mime_type(),
                })
            })
            .collect()
    }

    /// Templated resources for a `resources/templates/list` result.
    pub fn template_descriptors(&self) -> Vec<Value> {
        self.resources
            .values()
            .filter(|r| is_template(r.uri_template()))
            .map(|r| {
                json!({
                    "uriTemplate": r.uri_template(),
                    "name": r.name(),
                    "description": r.description(),
                    "mimeType": r.mime_type(),
                })
            })
            .collect()
    }
}

fn is_template(uri: &str) -> bool {
    uri.contains('{')
}

/// Match `uri` against a `{name}` template and collect the placeholder values.
fn match_template(template: &str, uri: &str) -> Option<BTreeMap<String, String>> {
    let mut variables = BTreeMap::new();
    let mut template = template;
    let mut rest = uri;

    loop {
        let Some(start) = template.find('{') else {
            return (rest == template).then_some(variables);
        };
        rest = rest.strip_prefix(&template[..start])?;
        let end = start + template[start..].find('}')?;
        let name = &template[start + 1..end];
        template = &template[end + 1..];

        // A value runs up to the next segment or the next literal character
        let next = template.chars().next();
        let len = rest
            .find(|c| c == '/' || Some(c) == next)
            .unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        variables.insert(name.to_string(), rest[..len].to_string());
        rest = &rest[len..];
    }
}

/// Wrap text as the result of a `resources/read`.
pub fn resource_contents(uri: &str, mime_type: &str, text: impl Into<String>) -> Value {
    json!({
        "contents": [
            { "uri": uri, "mimeType": mime_type, "text": text.into() }
        ]
    })
}
