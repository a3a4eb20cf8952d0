use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::tool::{Tool, ToolContext, ToolError, ToolResult, ToolSource};

/// Transport to an MCP server. The stdio/RPC client lives outside the core;
/// the runtime only needs tool discovery and invocation.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, ToolError>;
    async fn call_tool(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// A remote tool surfaced under the namespaced id `mcp.<server>.<tool>`.
pub struct McpProxyTool {
    id: String,
    server: String,
    info: McpToolInfo,
    transport: Arc<dyn McpTransport>,
}

impl McpProxyTool {
    pub fn new(server: impl Into<String>, info: McpToolInfo, transport: Arc<dyn McpTransport>) -> Self {
        let server = server.into();
        Self {
            id: format!("mcp.{server}.{}", info.name),
            server,
            info,
            transport,
        }
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.info.input_schema.clone()
    }

    fn source(&self) -> ToolSource {
        ToolSource::Mcp
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        validate_against_schema(&args, &self.info.input_schema)?;

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let response = self.transport.call_tool(&self.info.name, args).await?;
        let content = render_mcp_content(&response);

        Ok(ToolResult::ok(content)
            .with_metadata("server", serde_json::json!(self.server))
            .with_metadata("tool", serde_json::json!(self.info.name)))
    }
}

/// Discover a server's tools and register them under their namespaced ids.
/// Returns the number of tools registered.
pub async fn register_mcp_server(
    registry: &ToolRegistry,
    server: &str,
    transport: Arc<dyn McpTransport>,
) -> Result<usize, ToolError> {
    let tools = transport.list_tools().await?;
    let mut registered = 0;
    for info in tools {
        let proxy = McpProxyTool::new(server, info, Arc::clone(&transport));
        match registry.register(proxy).await {
            Ok(()) => registered += 1,
            Err(error) => {
                tracing::warn!(server, %error, "skipping MCP tool with invalid name");
            }
        }
    }
    Ok(registered)
}

pub async fn unregister_mcp_server(registry: &ToolRegistry, server: &str) -> usize {
    let prefix = format!("mcp.{server}.");
    let mut removed = 0;
    for id in registry.list_ids().await {
        if id.starts_with(&prefix) && registry.unregister(&id).await {
            removed += 1;
        }
    }
    removed
}

/// Minimal JSON-schema validation for MCP arguments: object shape,
/// required keys, and primitive type tags of declared properties.
fn validate_against_schema(
    args: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), ToolError> {
    if schema.get("type").and_then(|v| v.as_str()) == Some("object") && !args.is_object() {
        return Err(ToolError::InvalidArguments(
            "arguments must be an object".to_string(),
        ));
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if args.get(key).is_none() {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument `{key}`"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, prop) in properties {
            let Some(value) = args.get(key) else { continue };
            let Some(expected) = prop.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(ToolError::InvalidArguments(format!(
                    "argument `{key}` should be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

/// MCP responses carry `{content: [{type: "text", text}, ...]}`; fall back
/// to raw JSON for anything else.
fn render_mcp_content(response: &serde_json::Value) -> String {
    let parts: Vec<String> = response
        .get("content")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if parts.is_empty() {
        response.to_string()
    } else {
        parts.join("\n\n")
    }
}
