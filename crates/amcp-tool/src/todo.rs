use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::tool::{require_str, Tool, ToolContext, ToolError, ToolResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "pending".to_string()
}

const VALID_STATUSES: &[&str] = &["pending", "in_progress", "completed", "cancelled"];

/// Session-scoped todo list for tracking multi-step work.
pub struct TodoTool {
    store: Arc<Mutex<HashMap<String, Vec<TodoItem>>>>,
}

impl TodoTool {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for TodoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TodoTool {
    fn id(&self) -> &str {
        "todo"
    }

    fn description(&self) -> &str {
        "Manage a todo list for the session. action='read' lists current todos, \
         action='write' replaces the list."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["read", "write"],
                    "description": "'read' to view todos, 'write' to replace the list"
                },
                "todos": {
                    "type": "array",
                    "description": "Complete todo list (required for 'write')",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "content": {"type": "string"},
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "cancelled"]
                            }
                        },
                        "required": ["id", "content"]
                    }
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let action = require_str(&args, "action")?;
        match action {
            "read" => self.read(&ctx.session_id).await,
            "write" => {
                let todos: Vec<TodoItem> = args
                    .get("todos")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| ToolError::InvalidArguments(format!("invalid todos: {e}")))?
                    .unwrap_or_default();
                self.write(&ctx.session_id, todos).await
            }
            other => Err(ToolError::InvalidArguments(format!(
                "invalid action `{other}`, use 'read' or 'write'"
            ))),
        }
    }
}

impl TodoTool {
    async fn read(&self, session_id: &str) -> Result<ToolResult, ToolError> {
        let store = self.store.lock().await;
        let todos = store.get(session_id).cloned().unwrap_or_default();

        if todos.is_empty() {
            return Ok(ToolResult::ok("No todos.").with_metadata("count", serde_json::json!(0)));
        }

        let mut lines = vec!["## Todo List".to_string(), String::new()];
        for todo in &todos {
            lines.push(format!("- [{}] {} ({})", todo.id, todo.content, todo.status));
        }
        Ok(ToolResult::ok(lines.join("\n"))
            .with_metadata("count", serde_json::json!(todos.len())))
    }

    async fn write(
        &self,
        session_id: &str,
        todos: Vec<TodoItem>,
    ) -> Result<ToolResult, ToolError> {
        let mut seen = std::collections::HashSet::new();
        for todo in &todos {
            if !VALID_STATUSES.contains(&todo.status.as_str()) {
                return Err(ToolError::InvalidArguments(format!(
                    "invalid status `{}` for todo {}",
                    todo.status, todo.id
                )));
            }
            if !seen.insert(todo.id.clone()) {
                return Err(ToolError::InvalidArguments("todo ids must be unique".to_string()));
            }
        }

        let count = todos.len();
        self.store
            .lock()
            .await
            .insert(session_id.to_string(), todos);
        Ok(ToolResult::ok(format!("Updated {count} todos."))
            .with_metadata("count", serde_json::json!(count)))
    }
}
