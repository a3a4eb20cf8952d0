use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed taxonomy of server events. The serialized form is the dotted
/// string that appears on the wire (SSE event names, WS payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.deleted")]
    SessionDeleted,
    #[serde(rename = "session.status_changed")]
    SessionStatusChanged,
    #[serde(rename = "session.busy")]
    SessionBusy,
    #[serde(rename = "session.idle")]
    SessionIdle,

    #[serde(rename = "message.start")]
    MessageStart,
    #[serde(rename = "message.chunk")]
    MessageChunk,
    #[serde(rename = "message.complete")]
    MessageComplete,
    #[serde(rename = "message.error")]
    MessageError,

    #[serde(rename = "tool.call_start")]
    ToolCallStart,
    #[serde(rename = "tool.call_complete")]
    ToolCallComplete,
    #[serde(rename = "tool.call_error")]
    ToolCallError,

    #[serde(rename = "agent.thinking")]
    AgentThinking,
    #[serde(rename = "agent.idle")]
    AgentIdle,

    #[serde(rename = "prompt.received")]
    PromptReceived,
    #[serde(rename = "prompt.started")]
    PromptStarted,
    #[serde(rename = "prompt.queued")]
    PromptQueued,
    #[serde(rename = "prompt.rejected")]
    PromptRejected,

    #[serde(rename = "context.compacted")]
    ContextCompacted,
    #[serde(rename = "approval_required")]
    ApprovalRequired,
    #[serde(rename = "system.shutdown")]
    Shutdown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Heartbeat => "heartbeat",
            EventKind::SessionCreated => "session.created",
            EventKind::SessionDeleted => "session.deleted",
            EventKind::SessionStatusChanged => "session.status_changed",
            EventKind::SessionBusy => "session.busy",
            EventKind::SessionIdle => "session.idle",
            EventKind::MessageStart => "message.start",
            EventKind::MessageChunk => "message.chunk",
            EventKind::MessageComplete => "message.complete",
            EventKind::MessageError => "message.error",
            EventKind::ToolCallStart => "tool.call_start",
            EventKind::ToolCallComplete => "tool.call_complete",
            EventKind::ToolCallError => "tool.call_error",
            EventKind::AgentThinking => "agent.thinking",
            EventKind::AgentIdle => "agent.idle",
            EventKind::PromptReceived => "prompt.received",
            EventKind::PromptStarted => "prompt.started",
            EventKind::PromptQueued => "prompt.queued",
            EventKind::PromptRejected => "prompt.rejected",
            EventKind::ContextCompacted => "context.compacted",
            EventKind::ApprovalRequired => "approval_required",
            EventKind::Shutdown => "system.shutdown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event flowing over the bus and out to every attached transport.
/// Events carry session ids, never references, so the bus stays a leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            source: String::new(),
            session_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn for_session(
        kind: EventKind,
        session_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            source: String::new(),
            session_id: Some(session_id.into()),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}
