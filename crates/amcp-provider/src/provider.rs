use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use amcp_types::Message;

/// One tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ProviderToolDef>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ProviderToolDef>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TurnUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Incremental events of one streamed assistant turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    /// A fragment of the JSON arguments for an in-flight tool call.
    ToolCallDelta { id: String, arguments: String },
    Usage(TurnUsage),
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::RateLimited => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_context_overflow(&self) -> bool {
        matches!(self, ProviderError::ContextOverflow(_))
    }
}

pub type ChatStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// An LLM backend. Implementations live at the edge of the system; the
/// agent loop only consumes the stream.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError>;
}
