use amcp_provider::ProviderError;
use amcp_session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("empty prompt")]
    EmptyPrompt,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session is busy: {0}")]
    SessionBusy(String),

    #[error("llm error: {0}")]
    Provider(#[from] ProviderError),

    #[error("prompt blocked by hook: {0}")]
    PromptBlocked(String),

    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// The wire error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::EmptyPrompt => "VALIDATION_ERROR",
            AgentError::Session(SessionError::NotFound(_)) => "SESSION_NOT_FOUND",
            AgentError::Session(SessionError::MaxSessions(_)) => "CONFLICT",
            AgentError::SessionBusy(_) => "SESSION_BUSY",
            AgentError::Provider(_) => "LLM_ERROR",
            AgentError::PromptBlocked(_) => "FORBIDDEN",
            AgentError::Cancelled => "CANCELLED",
        }
    }
}
