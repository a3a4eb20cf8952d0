use async_trait::async_trait;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn id(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing the first occurrence of old_text with new_text. \
         old_text must match exactly."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to edit"},
                "old_text": {"type": "string", "description": "Text to search for (exact match)"},
                "new_text": {"type": "string", "description": "Replacement text"}
            },
            "required": ["path", "old_text", "new_text"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let path = require_str(&args, "path")?;
        let old_text = require_str(&args, "old_text")?;
        let new_text = require_str(&args, "new_text")?;

        let resolved = ctx.resolve_path(path).await?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::FileNotFound(path.to_string()),
                _ => ToolError::ExecutionError(format!("failed to read {path}: {e}")),
            })?;

        let Some(offset) = content.find(old_text) else {
            return Err(ToolError::ExecutionError(format!(
                "old_text not found in {path}"
            )));
        };

        let mut updated = String::with_capacity(content.len());
        updated.push_str(&content[..offset]);
        updated.push_str(new_text);
        updated.push_str(&content[offset + old_text.len()..]);

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        tokio::fs::write(&resolved, updated)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("failed to write {path}: {e}")))?;

        Ok(ToolResult::ok(format!("Edited {}", resolved.display()))
            .with_metadata("file_path", serde_json::json!(resolved.display().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new("ses_e", dir.to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn replaces_first_occurrence_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();

        EditFileTool
            .execute(
                serde_json::json!({"path": "f.txt", "old_text": "aaa", "new_text": "ccc"}),
                ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "ccc bbb aaa"
        );
    }

    #[tokio::test]
    async fn missing_old_text_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "content").unwrap();

        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "f.txt", "old_text": "absent", "new_text": "x"}),
                ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "gone.txt", "old_text": "a", "new_text": "b"}),
                ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::FileNotFound(_)));
    }
}
