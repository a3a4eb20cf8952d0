use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Builtin,
    Mcp,
}

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

/// A permission question raised from inside a tool, e.g. a path that
/// escapes the project root.
#[derive(Debug, Clone)]
pub struct PermissionProbe {
    pub permission: String,
    pub value: String,
}

pub type AskCallback = Arc<
    dyn Fn(PermissionProbe) -> Pin<Box<dyn Future<Output = Result<(), ToolError>> + Send>>
        + Send
        + Sync,
>;

/// Request handled by the agent when the `task` tool delegates work.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub description: String,
    pub prompt: String,
    pub agent_type: String,
    pub tools: Vec<String>,
}

pub type DelegateCallback = Arc<
    dyn Fn(DelegateRequest) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// Per-invocation context handed to every tool. Paths resolve against
/// `directory`; `abort` is the per-call cancellation token the agent trips
/// on a forced cancel.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub call_id: Option<String>,
    pub agent: String,
    pub directory: String,
    pub project_root: String,
    pub abort: CancellationToken,
    pub default_max_lines: usize,
    pub ask: Option<AskCallback>,
    pub delegate: Option<DelegateCallback>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, directory: impl Into<String>) -> Self {
        let directory = directory.into();
        Self {
            session_id: session_id.into(),
            call_id: None,
            agent: String::new(),
            project_root: directory.clone(),
            directory,
            abort: CancellationToken::new(),
            default_max_lines: 400,
            ask: None,
            delegate: None,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_ask<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(PermissionProbe) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ToolError>> + Send + 'static,
    {
        self.ask = Some(Arc::new(move |probe| Box::pin(callback(probe))));
        self
    }

    pub fn with_delegate<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(DelegateRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.delegate = Some(Arc::new(move |request| Box::pin(callback(request))));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolve a tool-supplied path against the session directory and run
    /// the `external_path` permission check when it escapes the project
    /// root.
    pub async fn resolve_path(&self, path: &str) -> Result<PathBuf, ToolError> {
        let resolved = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            Path::new(&self.directory).join(path)
        };

        if self.is_external_path(&resolved) {
            self.ask_permission(PermissionProbe {
                permission: "external_path".to_string(),
                value: resolved.display().to_string(),
            })
            .await?;
        }

        Ok(resolved)
    }

    pub fn is_external_path(&self, path: &Path) -> bool {
        let normalized = normalize(path);
        let root = normalize(Path::new(&self.project_root));
        !normalized.starts_with(&root)
    }

    pub async fn ask_permission(&self, probe: PermissionProbe) -> Result<(), ToolError> {
        if let Some(callback) = &self.ask {
            callback(probe).await
        } else {
            Ok(())
        }
    }

    pub async fn run_delegate(&self, request: DelegateRequest) -> Result<String, ToolError> {
        match &self.delegate {
            Some(callback) => callback(request).await,
            None => Err(ToolError::ExecutionError(
                "delegation is not available in this session".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("call_id", &self.call_id)
            .field("agent", &self.agent)
            .field("directory", &self.directory)
            .field("project_root", &self.project_root)
            .finish()
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so nonexistent paths still compare against the root.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                result.pop();
            }
            other => result.push(other),
        }
    }
    result
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier; must match `[A-Za-z0-9_.:-]+`.
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object, advertised to the model.
    fn parameters(&self) -> serde_json::Value;

    fn source(&self) -> ToolSource {
        ToolSource::Builtin
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError>;
}

/// Extract a required string argument.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required argument `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relative_paths_resolve_against_directory() {
        let ctx = ToolContext::new("ses_t", "/work/project");
        let path = ctx.resolve_path("src/lib.rs").await.unwrap();
        assert_eq!(path, PathBuf::from("/work/project/src/lib.rs"));
    }

    #[tokio::test]
    async fn external_paths_trigger_ask() {
        let asked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = asked.clone();
        let ctx = ToolContext::new("ses_t", "/work/project").with_ask(move |probe| {
            let flag = flag.clone();
            async move {
                assert_eq!(probe.permission, "external_path");
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });

        ctx.resolve_path("/etc/hosts").await.unwrap();
        assert!(asked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dotdot_escape_counts_as_external() {
        let ctx = ToolContext::new("ses_t", "/work/project").with_ask(|_| async {
            Err(ToolError::PermissionDenied("outside project".to_string()))
        });
        let err = ctx.resolve_path("../secrets.txt").await.unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn missing_ask_callback_allows() {
        let ctx = ToolContext::new("ses_t", "/work/project");
        assert!(ctx.resolve_path("/outside").await.is_ok());
    }
}
