use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use amcp_types::AgentSpec;

use crate::tool::{Tool, ToolContext, ToolError, ToolResult, ToolSource};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").unwrap());

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub source: ToolSource,
}

/// Name-keyed tool map. Read-mostly: writes happen at startup and at MCP
/// connect/disconnect, so callers snapshot schemas at prompt start.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register<T: Tool + 'static>(&self, tool: T) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool)).await
    }

    pub async fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let id = tool.id().to_string();
        if !NAME_RE.is_match(&id) {
            return Err(ToolError::InvalidArguments(format!(
                "invalid tool name `{id}`"
            )));
        }
        self.tools.write().await.insert(id, tool);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Schemas of every registered tool, sorted by name.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().await;
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.id().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
                source: tool.source(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas filtered by an agent's allow/exclude lists.
    pub async fn schemas_for(&self, spec: &AgentSpec) -> Vec<ToolSchema> {
        self.schemas()
            .await
            .into_iter()
            .filter(|schema| spec.allows_tool(&schema.name))
            .collect()
    }

    /// Total execution: every failure mode, including an unknown tool,
    /// becomes a `ToolResult` with `success = false`.
    pub async fn execute(&self, name: &str, args: serde_json::Value, ctx: ToolContext) -> ToolResult {
        let Some(tool) = self.get(name).await else {
            let available = self.list_ids().await.join(", ");
            return ToolResult::fail(format!(
                "Tool '{name}' not found. Available tools: {available}"
            ))
            .with_metadata("code", serde_json::json!("TOOL_NOT_FOUND"));
        };

        match tool.execute(args, ctx).await {
            Ok(result) => result,
            Err(ToolError::Cancelled) => {
                ToolResult::fail("tool call cancelled").with_metadata("code", serde_json::json!("CANCELLED"))
            }
            Err(ToolError::Timeout(message)) => {
                ToolResult::fail(message).with_metadata("code", serde_json::json!("TIMEOUT"))
            }
            Err(error) => ToolResult::fail(error.to_string()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::default_agent_spec;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolResult, ToolError> {
            let text = crate::tool::require_str(&args, "text")?;
            Ok(ToolResult::ok(text))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn id(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Err(ToolError::ExecutionError("it broke".to_string()))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("ses_r", "/tmp")
    }

    #[tokio::test]
    async fn register_and_execute() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).await.unwrap();

        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}), ctx())
            .await;
        assert!(result.success);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let registry = ToolRegistry::new();

        struct BadName;
        #[async_trait]
        impl Tool for BadName {
            fn id(&self) -> &str {
                "has spaces"
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn execute(
                &self,
                _args: serde_json::Value,
                _ctx: ToolContext,
            ) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::ok(""))
            }
        }

        assert!(registry.register(BadName).await.is_err());
    }

    #[tokio::test]
    async fn execute_is_total() {
        let registry = ToolRegistry::new();
        registry.register(PanickyTool).await.unwrap();

        let missing = registry.execute("nope", serde_json::json!({}), ctx()).await;
        assert!(!missing.success);
        assert!(missing.content.contains("not found"));

        let failed = registry.execute("broken", serde_json::json!({}), ctx()).await;
        assert!(!failed.success);
        assert!(failed.content.contains("it broke"));

        let bad_args = registry.execute("broken", serde_json::json!(null), ctx()).await;
        assert!(!bad_args.success);
    }

    #[tokio::test]
    async fn schemas_respect_agent_filters() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).await.unwrap();
        registry.register(PanickyTool).await.unwrap();

        let mut spec = default_agent_spec();
        assert_eq!(registry.schemas_for(&spec).await.len(), 2);

        spec.exclude_tools = vec!["broken".to_string()];
        let filtered = registry.schemas_for(&spec).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");

        spec.tools = vec!["broken".to_string()];
        assert!(registry.schemas_for(&spec).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).await.unwrap();
        assert!(registry.unregister("echo").await);
        assert!(!registry.unregister("echo").await);
        assert!(registry.get("echo").await.is_none());
    }
}
