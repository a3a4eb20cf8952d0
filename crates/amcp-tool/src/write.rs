use async_trait::async_trait;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn id(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it (and parent directories) or overwriting it."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to write"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let path = require_str(&args, "path")?;
        let content = require_str(&args, "content")?;

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let resolved = ctx.resolve_path(path).await?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionError(format!("failed to create directories: {e}"))
            })?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("failed to write {path}: {e}")))?;

        Ok(ToolResult::ok(format!(
            "Wrote {} characters to {}",
            content.chars().count(),
            resolved.display()
        ))
        .with_metadata("file_path", serde_json::json!(resolved.display().to_string()))
        .with_metadata("size", serde_json::json!(content.len())))
    }
}
