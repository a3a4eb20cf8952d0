use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use amcp_agent::{PromptOutcome, PromptRequest};
use amcp_protocol::{to_ws_frame, WsFrame};
use amcp_types::{ConflictStrategy, Priority};

use crate::events;
use crate::state::ServerState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
}

/// `GET /ws?session_id=…` — bidirectional frame transport. Server→client
/// frames mirror the session's bus events; client→server messages carry
/// `payload.action ∈ {prompt, cancel}`.
pub async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>, session_id: Option<String>) {
    events::ws_connected();
    if let Some(session_id) = &session_id {
        state.sessions().adjust_connected_clients(session_id, 1).await;
    }

    let mut bus_rx = state.bus().subscribe_channel();
    // Outbound frames flow through an mpsc so the event forwarder and the
    // request handler can both write without sharing the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<WsFrame>(128);

    loop {
        tokio::select! {
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(filter) = &session_id {
                            if event.session_id.as_deref() != Some(filter.as_str()) {
                                continue;
                            }
                        }
                        let frame = to_ws_frame(&event, None);
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "ws client lagged behind the bus");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(frame) = out_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(raw))) => {
                        handle_client_message(&state, &session_id, raw.as_str(), &out_tx).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        tracing::debug!(%error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    if let Some(session_id) = &session_id {
        state
            .sessions()
            .adjust_connected_clients(session_id, -1)
            .await;
    }
    events::ws_disconnected();
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(WsMessage::Text(json.into())).await,
        Err(error) => {
            tracing::error!(%error, "ws frame failed to serialize");
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: ClientPayload,
}

#[derive(Debug, Deserialize, Default)]
struct ClientPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    force: bool,
}

async fn handle_client_message(
    state: &Arc<ServerState>,
    socket_session: &Option<String>,
    raw: &str,
    out_tx: &mpsc::Sender<WsFrame>,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(raw);
    let message = match parsed {
        Ok(message) => message,
        Err(error) => {
            let _ = out_tx
                .send(error_frame(None, "INVALID_JSON", &error.to_string()))
                .await;
            return;
        }
    };

    let session_id = message
        .payload
        .session_id
        .clone()
        .or_else(|| socket_session.clone());
    let Some(session_id) = session_id else {
        let _ = out_tx
            .send(error_frame(
                message.id,
                "VALIDATION_ERROR",
                "session_id required",
            ))
            .await;
        return;
    };

    match message.payload.action.as_str() {
        "prompt" => {
            let request = PromptRequest {
                session_id: session_id.clone(),
                content: message.payload.content.clone(),
                priority: message.payload.priority.unwrap_or_default(),
                conflict_strategy: ConflictStrategy::Queue,
            };

            match state.runtime.submit(request).await {
                Ok(PromptOutcome::Started { message_id, done }) => {
                    let _ = out_tx
                        .send(response_frame(
                            message.id,
                            serde_json::json!({"status": "streaming", "message_id": message_id}),
                        ))
                        .await;
                    // The completion itself arrives as bus events; just keep
                    // the receiver alive so the result is not dropped early.
                    tokio::spawn(async move {
                        let _ = done.await;
                    });
                }
                Ok(PromptOutcome::Queued {
                    message_id,
                    position,
                }) => {
                    let _ = out_tx
                        .send(response_frame(
                            message.id,
                            serde_json::json!({
                                "status": "queued",
                                "message_id": message_id,
                                "position": position,
                            }),
                        ))
                        .await;
                }
                Err(error) => {
                    let _ = out_tx
                        .send(error_frame(message.id, error.code(), &error.to_string()))
                        .await;
                }
            }
        }
        "cancel" => {
            let cancelled = state.runtime.cancel(&session_id, message.payload.force).await;
            let _ = out_tx
                .send(response_frame(
                    message.id,
                    serde_json::json!({"cancelled": cancelled, "session_id": session_id}),
                ))
                .await;
        }
        other => {
            let _ = out_tx
                .send(error_frame(
                    message.id,
                    "BAD_REQUEST",
                    &format!("unsupported action `{other}`"),
                ))
                .await;
        }
    }
}

fn response_frame(id: Option<String>, payload: serde_json::Value) -> WsFrame {
    WsFrame {
        frame_type: "response".to_string(),
        id,
        timestamp: chrono::Utc::now(),
        payload,
    }
}

fn error_frame(id: Option<String>, code: &str, message: &str) -> WsFrame {
    WsFrame {
        frame_type: "error".to_string(),
        id,
        timestamp: chrono::Utc::now(),
        payload: serde_json::json!({"code": code, "error": message}),
    }
}
