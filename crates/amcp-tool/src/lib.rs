pub mod apply_patch;
pub mod bash;
pub mod edit;
pub mod grep;
pub mod mcp;
pub mod read;
pub mod registry;
pub mod task;
pub mod think;
pub mod todo;
pub mod tool;
pub mod write;

pub use mcp::{register_mcp_server, McpToolInfo, McpTransport};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{
    DelegateRequest, PermissionProbe, Tool, ToolContext, ToolError, ToolResult, ToolSource,
};

/// Registry with every built-in tool installed.
pub async fn create_default_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();

    let _ = registry.register(read::ReadFileTool::new()).await;
    let _ = registry.register(grep::GrepTool::new()).await;
    let _ = registry.register(bash::BashTool::new()).await;
    let _ = registry.register(think::ThinkTool).await;
    let _ = registry.register(todo::TodoTool::new()).await;
    let _ = registry.register(write::WriteFileTool).await;
    let _ = registry.register(edit::EditFileTool).await;
    let _ = registry.register(apply_patch::ApplyPatchTool).await;
    let _ = registry.register(task::TaskTool).await;

    registry
}
