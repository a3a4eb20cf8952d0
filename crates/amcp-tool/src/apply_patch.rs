use async_trait::async_trait;
use std::path::PathBuf;

use amcp_patch::{apply, parse, FileOutcome, PatchError};

use crate::tool::{require_str, PermissionProbe, Tool, ToolContext, ToolError, ToolResult};

pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn id(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a multi-file patch framed by '*** Begin Patch' / '*** End Patch'. \
         Supports Add File, Update File (with @@ context anchors and optional \
         Move to), and Delete File operations. Nothing is written unless the \
         whole patch validates."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "The full patch text describing all changes"
                }
            },
            "required": ["patch"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let patch_text = require_str(&args, "patch")?;
        if patch_text.trim().is_empty() {
            return Err(ToolError::InvalidArguments("patch is required".to_string()));
        }

        let patch = parse(patch_text).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let base_dir = PathBuf::from(&ctx.directory);
        for op in &patch.ops {
            let full = base_dir.join(op.path());
            if ctx.is_external_path(&full) {
                ctx.ask_permission(PermissionProbe {
                    permission: "external_path".to_string(),
                    value: full.display().to_string(),
                })
                .await?;
            }
        }

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let outcomes = tokio::task::spawn_blocking(move || apply(&patch, &base_dir))
            .await
            .map_err(|e| ToolError::ExecutionError(format!("patch task failed: {e}")))?
            .map_err(|e| match &e {
                PatchError::Apply { searched, .. } if !searched.is_empty() => {
                    ToolError::ExecutionError(format!(
                        "{e}\nSearched for:\n{}",
                        searched.join("\n")
                    ))
                }
                _ => ToolError::ExecutionError(e.to_string()),
            })?;

        let summary: Vec<String> = outcomes
            .iter()
            .map(|outcome| match outcome {
                FileOutcome::Created { path } => format!("A {path}"),
                FileOutcome::Deleted { path } => format!("D {path}"),
                FileOutcome::Updated { path } => format!("M {path}"),
                FileOutcome::Renamed { from, to } => format!("R {from} -> {to}"),
            })
            .collect();

        Ok(ToolResult::ok(format!(
            "Applied patch:\n{}",
            summary.join("\n")
        ))
        .with_metadata("files", serde_json::to_value(&outcomes).unwrap_or_default()))
    }
}
