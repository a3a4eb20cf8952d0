use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 600;

pub struct BashTool;

impl BashTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BashTool {
    fn id(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the session working directory. \
         Returns stdout and stderr; non-zero exit codes are reported as failures."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 600,
                    "description": "Timeout in seconds (default 30)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let command = require_str(&args, "command")?.to_string();
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let mut child = shell(&command)
            .current_dir(&ctx.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionError(format!("failed to spawn shell: {e}")))?;

        let wait = async {
            tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output()).await
        };

        // A forced cancel kills the process group via the abort token.
        let output = tokio::select! {
            result = wait => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ToolError::ExecutionError(format!("command failed: {e}")));
                }
                Err(_) => {
                    return Err(ToolError::Timeout(format!(
                        "command timed out after {timeout} seconds"
                    )));
                }
            },
            _ = ctx.abort.cancelled() => {
                return Err(ToolError::Cancelled);
            }
        };

        let mut content = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            content.push_str("\n[stderr]\n");
            content.push_str(&stderr);
        }
        if content.trim().is_empty() {
            content = "(no output)".to_string();
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let mut result = if output.status.success() {
            ToolResult::ok(content)
        } else {
            ToolResult::fail(format!("{content}\nCommand exited with code {exit_code}"))
        };
        result = result
            .with_metadata("command", serde_json::json!(command))
            .with_metadata("exit_code", serde_json::json!(exit_code));
        Ok(result)
    }
}

#[cfg(unix)]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command).kill_on_drop(true);
    cmd
}
