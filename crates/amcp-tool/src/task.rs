use async_trait::async_trait;

use crate::tool::{require_str, DelegateRequest, Tool, ToolContext, ToolError, ToolResult};

/// Delegation seam: spawns a subagent through the agent-installed callback
/// and returns its final answer as the tool result.
pub struct TaskTool;

#[async_trait]
impl Tool for TaskTool {
    fn id(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a well-scoped task to a subagent. The subagent shares the \
         working directory but keeps its own conversation; its final answer \
         is returned here. Use agent_type 'explorer' for read-only \
         exploration, 'planner' for analysis, 'focused_coder' for \
         implementation."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Short label for the delegated task"
                },
                "prompt": {
                    "type": "string",
                    "description": "The full instruction for the subagent"
                },
                "agent_type": {
                    "type": "string",
                    "enum": ["explorer", "planner", "focused_coder"],
                    "description": "Subagent profile (default focused_coder)"
                },
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Restrict the subagent to these tools"
                }
            },
            "required": ["description", "prompt"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let description = require_str(&args, "description")?.to_string();
        let prompt = require_str(&args, "prompt")?.to_string();
        let agent_type = args
            .get("agent_type")
            .and_then(|v| v.as_str())
            .unwrap_or("focused_coder")
            .to_string();
        let tools: Vec<String> = args
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let output = ctx
            .run_delegate(DelegateRequest {
                description: description.clone(),
                prompt,
                agent_type,
                tools,
            })
            .await?;

        Ok(ToolResult::ok(output).with_metadata("description", serde_json::json!(description)))
    }
}
