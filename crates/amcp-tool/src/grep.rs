use async_trait::async_trait;
use std::path::Path;
use walkdir::WalkDir;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

const MAX_MATCHES: usize = 500;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

pub struct GrepTool;

impl GrepTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GrepTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn id(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in files under the working directory. \
         Returns matching lines with file paths and line numbers."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regex pattern to search for"},
                "paths": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Paths to search in (default: working directory)"
                },
                "ignore_case": {"type": "boolean", "description": "Case-insensitive search"},
                "hidden": {"type": "boolean", "description": "Include hidden files and directories"},
                "globs": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Filename glob filters, e.g. '*.rs'"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let pattern = require_str(&args, "pattern")?.to_string();
        let ignore_case = args.get("ignore_case").and_then(|v| v.as_bool()).unwrap_or(false);
        let hidden = args.get("hidden").and_then(|v| v.as_bool()).unwrap_or(false);
        let globs: Vec<String> = args
            .get("globs")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let regex = regex::RegexBuilder::new(&pattern)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|e| ToolError::InvalidArguments(format!("invalid pattern: {e}")))?;

        let mut roots = Vec::new();
        match args.get("paths").and_then(|v| v.as_array()) {
            Some(paths) if !paths.is_empty() => {
                for value in paths {
                    let path = value.as_str().ok_or_else(|| {
                        ToolError::InvalidArguments("paths must be strings".to_string())
                    })?;
                    roots.push(ctx.resolve_path(path).await?);
                }
            }
            _ => roots.push(ctx.resolve_path(".").await?),
        }

        let abort = ctx.abort.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            let mut matches = 0usize;

            'roots: for root in roots {
                for entry in WalkDir::new(&root)
                    .follow_links(false)
                    .into_iter()
                    // The search root itself is exempt from hidden filtering.
                    .filter_entry(|e| e.depth() == 0 || hidden || !is_hidden(e.path()))
                {
                    if abort.is_cancelled() {
                        return Err(ToolError::Cancelled);
                    }
                    let Ok(entry) = entry else { continue };
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                        continue;
                    }
                    if !globs.is_empty() && !matches_globs(entry.path(), &globs) {
                        continue;
                    }

                    let Ok(content) = std::fs::read_to_string(entry.path()) else {
                        continue;
                    };
                    for (lineno, line) in content.lines().enumerate() {
                        if regex.is_match(line) {
                            lines.push(format!("{}:{}:{}", entry.path().display(), lineno + 1, line));
                            matches += 1;
                            if matches >= MAX_MATCHES {
                                lines.push(format!("... (stopped after {MAX_MATCHES} matches)"));
                                break 'roots;
                            }
                        }
                    }
                }
            }

            Ok((lines, matches))
        })
        .await
        .map_err(|e| ToolError::ExecutionError(format!("search task failed: {e}")))?;

        let (lines, matches) = result?;
        let content = if lines.is_empty() {
            "No matches found.".to_string()
        } else {
            lines.join("\n")
        };

        Ok(ToolResult::ok(content)
            .with_metadata("pattern", serde_json::json!(pattern))
            .with_metadata("match_count", serde_json::json!(matches)))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n != "." && n != "..")
}

fn matches_globs(path: &Path, globs: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    globs.iter().any(|glob| glob_name_match(name, glob))
}

fn glob_name_match(name: &str, glob: &str) -> bool {
    // Filename globs only need `*` and `?`.
    let mut regex = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex).map(|re| re.is_match(name)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new("ses_grep", dir.to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\nfn helper() {}\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "nothing here\n").unwrap();

        let result = GrepTool::new()
            .execute(serde_json::json!({"pattern": "fn \\w+"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.content.contains("a.rs:1:fn main() {}"));
        assert!(result.content.contains("a.rs:2:fn helper() {}"));
        assert_eq!(result.metadata["match_count"], 2);
    }

    #[tokio::test]
    async fn no_matches_is_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();

        let result = GrepTool::new()
            .execute(serde_json::json!({"pattern": "zzz"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.content, "No matches found.");
    }

    #[tokio::test]
    async fn glob_filter_restricts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "needle\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "needle\n").unwrap();

        let result = GrepTool::new()
            .execute(
                serde_json::json!({"pattern": "needle", "globs": ["*.rs"]}),
                ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(result.content.contains("a.rs"));
        assert!(!result.content.contains("a.txt"));
    }

    #[tokio::test]
    async fn hidden_files_skipped_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".secret"), "needle\n").unwrap();

        let tool = GrepTool::new();
        let result = tool
            .execute(serde_json::json!({"pattern": "needle"}), ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.content, "No matches found.");

        let result = tool
            .execute(
                serde_json::json!({"pattern": "needle", "hidden": true}),
                ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(result.content.contains(".secret"));
    }

    #[tokio::test]
    async fn invalid_regex_is_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let err = GrepTool::new()
            .execute(serde_json::json!({"pattern": "(unclosed"}), ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
