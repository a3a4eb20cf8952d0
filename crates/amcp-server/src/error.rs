use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use amcp_agent::AgentError;
use amcp_protocol::{ErrorBody, ErrorCode};
use amcp_session::SessionError;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Session not found: {session_id}"),
        )
    }

    pub fn tool_not_found(tool_name: &str) -> Self {
        Self::new(
            ErrorCode::ToolNotFound,
            format!("Tool not found: {tool_name}"),
        )
    }

    pub fn agent_not_found(agent_name: &str) -> Self {
        Self::new(
            ErrorCode::AgentNotFound,
            format!("Agent not found: {agent_name}"),
        )
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match &error {
            SessionError::NotFound(_) => Self::new(ErrorCode::SessionNotFound, error.to_string()),
            SessionError::MaxSessions(_) => Self::new(ErrorCode::Conflict, error.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        let code = ErrorCode::parse(error.code()).unwrap_or(ErrorCode::InternalError);
        Self::new(code, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody::new(self.code, self.message));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
