use serde::{Deserialize, Serialize};

/// Wire error codes shared by the HTTP, WebSocket and SSE surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    ValidationError,
    InvalidJson,
    Unauthorized,
    Forbidden,
    NotFound,
    SessionNotFound,
    ToolNotFound,
    AgentNotFound,
    Conflict,
    SessionBusy,
    RateLimited,
    InternalError,
    LlmError,
    ToolError,
    McpError,
    Timeout,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest | ErrorCode::ValidationError | ErrorCode::InvalidJson => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound
            | ErrorCode::SessionNotFound
            | ErrorCode::ToolNotFound
            | ErrorCode::AgentNotFound => 404,
            ErrorCode::Conflict | ErrorCode::SessionBusy => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::InternalError
            | ErrorCode::LlmError
            | ErrorCode::ToolError
            | ErrorCode::McpError => 500,
            ErrorCode::Timeout => 504,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::SessionBusy => "SESSION_BUSY",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::LlmError => "LLM_ERROR",
            ErrorCode::ToolError => "TOOL_ERROR",
            ErrorCode::McpError => "MCP_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    /// Parse the code string the agent layer attaches to its errors.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "BAD_REQUEST" => Some(Self::BadRequest),
            "VALIDATION_ERROR" => Some(Self::ValidationError),
            "INVALID_JSON" => Some(Self::InvalidJson),
            "UNAUTHORIZED" => Some(Self::Unauthorized),
            "FORBIDDEN" => Some(Self::Forbidden),
            "NOT_FOUND" => Some(Self::NotFound),
            "SESSION_NOT_FOUND" => Some(Self::SessionNotFound),
            "TOOL_NOT_FOUND" => Some(Self::ToolNotFound),
            "AGENT_NOT_FOUND" => Some(Self::AgentNotFound),
            "CONFLICT" => Some(Self::Conflict),
            "SESSION_BUSY" => Some(Self::SessionBusy),
            "RATE_LIMITED" => Some(Self::RateLimited),
            "INTERNAL_ERROR" => Some(Self::InternalError),
            "LLM_ERROR" => Some(Self::LlmError),
            "TOOL_ERROR" => Some(Self::ToolError),
            "MCP_ERROR" => Some(Self::McpError),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(ErrorCode::ValidationError.http_status(), 400);
        assert_eq!(ErrorCode::SessionNotFound.http_status(), 404);
        assert_eq!(ErrorCode::SessionBusy.http_status(), 409);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::LlmError.http_status(), 500);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
    }

    #[test]
    fn serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::SessionBusy).unwrap();
        assert_eq!(json, "\"SESSION_BUSY\"");
        assert_eq!(ErrorCode::parse("SESSION_BUSY"), Some(ErrorCode::SessionBusy));
    }

    #[test]
    fn body_round_trips() {
        let body = ErrorBody::new(ErrorCode::ToolNotFound, "Tool not found: frobnicate")
            .with_details(serde_json::json!({"tool_name": "frobnicate"}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "TOOL_NOT_FOUND");
        assert_eq!(json["details"]["tool_name"], "frobnicate");
    }
}
