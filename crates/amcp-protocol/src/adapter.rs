use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use amcp_types::{Event, EventKind};

/// WebSocket envelope: `{type, id?, timestamp, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Translate one internal event into the WebSocket frame shape. The
/// payload's `kind` collapses the event taxonomy into what interactive
/// clients render: text, tool_call, tool_result, complete.
pub fn to_ws_frame(event: &Event, id: Option<String>) -> WsFrame {
    let kind = match event.kind {
        EventKind::MessageChunk => "text",
        EventKind::ToolCallStart => "tool_call",
        EventKind::ToolCallComplete | EventKind::ToolCallError => "tool_result",
        EventKind::MessageComplete => "complete",
        other => other.as_str(),
    };

    let mut payload = serde_json::json!({
        "kind": kind,
        "event": event.kind.as_str(),
    });
    if let Some(session_id) = &event.session_id {
        payload["session_id"] = serde_json::json!(session_id);
    }
    if let Some(object) = payload.as_object_mut() {
        if let Some(data) = event.payload.as_object() {
            for (key, value) in data {
                object.insert(key.clone(), value.clone());
            }
        }
    }

    WsFrame {
        frame_type: "event".to_string(),
        id,
        timestamp: event.timestamp,
        payload,
    }
}

/// SSE wire form: `event: <dotted-kind>\ndata: <json>\n\n`.
pub fn to_sse_frame(event: &Event) -> String {
    let data = serde_json::json!({
        "type": event.kind.as_str(),
        "session_id": event.session_id,
        "timestamp": event.timestamp.to_rfc3339(),
        "payload": event.payload,
    });
    format!("event: {}\ndata: {}\n\n", event.kind.as_str(), data)
}

/// The plain-text streaming body: bare text for chunks, bracketed inline
/// markers for tool activity, nothing for bookkeeping events.
pub fn to_http_chunk(event: &Event) -> Option<String> {
    match event.kind {
        EventKind::MessageChunk => event
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        EventKind::ToolCallStart => {
            let name = event
                .payload
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            Some(format!("\n[tool: {name}]\n"))
        }
        EventKind::ToolCallComplete => {
            let name = event
                .payload
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            Some(format!("[tool done: {name}]\n"))
        }
        EventKind::ToolCallError => {
            let name = event
                .payload
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            Some(format!("[tool failed: {name}]\n"))
        }
        EventKind::MessageError => {
            let code = event
                .payload
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or("INTERNAL_ERROR");
            Some(format!("\n[error: {code}]\n"))
        }
        _ => None,
    }
}

/// Ingest an ACP-style `session_update` from an external agent and map it
/// onto the internal taxonomy.
pub fn from_acp_update(update: &serde_json::Value, session_id: Option<&str>) -> Option<Event> {
    let update_kind = update.get("session_update").and_then(|v| v.as_str())?;

    let kind = match update_kind {
        "agent_message" => EventKind::MessageChunk,
        "agent_response" => EventKind::MessageComplete,
        "agent_thought" | "plan" => EventKind::AgentThinking,
        "tool_call_start" => EventKind::ToolCallStart,
        "tool_call_update" => EventKind::ToolCallComplete,
        "current_mode_update" => EventKind::SessionStatusChanged,
        _ => return None,
    };

    let mut payload = update.clone();
    if let Some(object) = payload.as_object_mut() {
        object.remove("session_update");
    }

    let mut event = Event::new(kind, payload);
    event.session_id = session_id.map(str::to_string);
    Some(event)
}
