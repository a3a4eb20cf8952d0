use async_trait::async_trait;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

pub struct ReadFileTool {
    max_lines_cap: usize,
}

impl ReadFileTool {
    pub fn new() -> Self {
        Self { max_lines_cap: 5_000 }
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn id(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns content with line numbers. \
         Use relative paths from the session working directory; optional line \
         ranges like '1-200' restrict the output."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read, relative to the working directory"
                },
                "ranges": {
                    "type": "array",
                    "items": {"type": "string", "pattern": "^\\d+-\\d+$"},
                    "description": "Optional list of line ranges like '1-200'"
                },
                "max_lines": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 5000,
                    "description": "Maximum lines returned per block (default 400)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let path = require_str(&args, "path")?;
        let max_lines = args
            .get("max_lines")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(ctx.default_max_lines)
            .min(self.max_lines_cap);

        let resolved = ctx.resolve_path(path).await?;
        if resolved.is_dir() {
            return Err(ToolError::InvalidArguments(format!(
                "{path} is a directory, not a file"
            )));
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::FileNotFound(path.to_string()),
                _ => ToolError::ExecutionError(format!("failed to read {path}: {e}")),
            })?;

        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Ok(ToolResult::ok(format!("**{}** (empty file)", resolved.display()))
                .with_metadata("file_path", serde_json::json!(resolved.display().to_string()))
                .with_metadata("lines_returned", serde_json::json!(0)));
        }
        let ranges = parse_ranges(&args, lines.len())?;

        let mut parts = Vec::new();
        let mut total = 0usize;
        for (start, end) in &ranges {
            parts.push(format!("**{}:{}-{}**", resolved.display(), start, end));
            let block = &lines[start - 1..*end];
            for (offset, line) in block.iter().take(max_lines).enumerate() {
                parts.push(format!("{:>6} | {}", start + offset, line));
            }
            if block.len() > max_lines {
                parts.push("... (truncated)".to_string());
            }
            total += block.len().min(max_lines);
        }

        Ok(ToolResult::ok(parts.join("\n"))
            .with_metadata("file_path", serde_json::json!(resolved.display().to_string()))
            .with_metadata("lines_returned", serde_json::json!(total)))
    }
}

fn parse_ranges(
    args: &serde_json::Value,
    line_count: usize,
) -> Result<Vec<(usize, usize)>, ToolError> {
    let Some(ranges) = args.get("ranges").and_then(|v| v.as_array()) else {
        return Ok(vec![(1, line_count.max(1))]);
    };
    if ranges.is_empty() {
        return Ok(vec![(1, line_count.max(1))]);
    }

    let mut parsed = Vec::new();
    for raw in ranges {
        let text = raw
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("ranges must be strings".to_string()))?;
        let (start, end) = text
            .split_once('-')
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)))
            .ok_or_else(|| {
                ToolError::InvalidArguments(format!("invalid range `{text}`, expected `start-end`"))
            })?;
        if start == 0 || end < start {
            return Err(ToolError::InvalidArguments(format!("invalid range `{text}`")));
        }
        parsed.push((start.min(line_count.max(1)), end.min(line_count.max(1))));
    }
    Ok(parsed)
}
