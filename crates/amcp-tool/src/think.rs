use async_trait::async_trait;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

/// No-op scratchpad: gives the model a place to reason without side
/// effects.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn id(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record internal reasoning or planning before taking action. Has no side effects."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "thought": {"type": "string", "description": "Thoughts, plans, or reasoning"}
            },
            "required": ["thought"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let thought = require_str(&args, "thought")?;
        Ok(ToolResult::ok(format!("Thinking: {thought}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_the_thought() {
        let result = ThinkTool
            .execute(
                serde_json::json!({"thought": "check the tests first"}),
                ToolContext::new("ses_t", "/tmp"),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.content.contains("check the tests first"));
    }

    #[tokio::test]
    async fn missing_thought_is_invalid() {
        let err = ThinkTool
            .execute(serde_json::json!({}), ToolContext::new("ses_t", "/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
