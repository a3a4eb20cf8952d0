use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use amcp_agent::{PromptOutcome, PromptRequest};
use amcp_permission::ApprovalResponse;
use amcp_protocol::{to_http_chunk, ErrorCode};
use amcp_tool::ToolContext;
use amcp_types::{ConflictStrategy, Priority, SessionInfo};

use crate::error::{ApiError, Result};
use crate::events;
use crate::state::{ServerState, CAPABILITIES, PROTOCOL_VERSION, SERVER_NAME};
use crate::ws;

pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/prompt", post(prompt_session))
        .route("/sessions/{id}/cancel", post(cancel_session))
        .route(
            "/sessions/{id}/permissions/{request_id}",
            post(respond_permission),
        )
        .route("/sessions/{id}/events", get(events::session_events))
        .route("/events", get(events::global_events))
        .route("/tools", get(list_tools))
        .route("/tools/{name}/execute", post(execute_tool))
        .route("/agents", get(list_agents))
        .route("/agents/{name}", get(get_agent));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
    uptime_seconds: f64,
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    name: String,
    version: String,
    protocol_version: String,
    capabilities: Vec<String>,
    agents: Vec<String>,
    tools_count: usize,
}

async fn info(State(state): State<Arc<ServerState>>) -> Json<InfoResponse> {
    let mut agents: Vec<String> = state.agents.keys().cloned().collect();
    agents.sort();
    Json(InfoResponse {
        name: SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        agents,
        tools_count: state.tools().len().await,
    })
}

async fn status(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions();
    let (active, total) = (sessions.active_count().await, sessions.count().await);
    let connections = events::connection_counts();

    Json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "sessions": {"active": active, "total": total},
        "connections": {
            "websocket": connections.websocket,
            "sse": connections.sse,
        },
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    cwd: Option<String>,
    agent_name: Option<String>,
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>)> {
    let spec = state
        .resolve_agent(req.agent_name.as_deref())
        .ok_or_else(|| ApiError::agent_not_found(req.agent_name.as_deref().unwrap_or("default")))?;

    let cwd = match req.cwd {
        Some(cwd) => cwd,
        None => state
            .config
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
            .to_string_lossy()
            .to_string(),
    };

    let info = state.sessions().create(cwd, spec).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionInfo>,
    total: usize,
}

async fn list_sessions(State(state): State<Arc<ServerState>>) -> Json<SessionListResponse> {
    let sessions = state.sessions().list().await;
    let total = sessions.len();
    Json(SessionListResponse { sessions, total })
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>> {
    let info = state.sessions().info(&session_id).await?;
    Ok(Json(info))
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    // Stop any running prompt before dropping the session.
    state.runtime.cancel(&session_id, true).await;
    state.sessions().delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PromptBody {
    content: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default = "default_stream")]
    stream: bool,
    #[serde(default)]
    conflict_strategy: ConflictStrategy,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct PromptResponse {
    session_id: String,
    message_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
}

async fn prompt_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<PromptBody>,
) -> Result<Response> {
    if body.content.trim().is_empty() {
        return Err(ApiError::validation("content must not be empty"));
    }

    // Subscribe before submitting so no event of this prompt is missed.
    let mut bus_rx = state.bus().subscribe_channel();

    let outcome = state
        .runtime
        .submit(PromptRequest {
            session_id: session_id.clone(),
            content: body.content,
            priority: body.priority,
            conflict_strategy: body.conflict_strategy,
        })
        .await?;

    match outcome {
        PromptOutcome::Queued {
            message_id,
            position,
        } => Ok(Json(PromptResponse {
            session_id,
            message_id,
            status: "queued".to_string(),
            result: None,
            position: Some(position),
        })
        .into_response()),

        PromptOutcome::Started { message_id, done } if !body.stream => {
            let result = done
                .await
                .map_err(|_| ApiError::new(ErrorCode::InternalError, "prompt task dropped"))?;
            match result {
                Ok(text) => Ok(Json(PromptResponse {
                    session_id,
                    message_id,
                    status: "complete".to_string(),
                    result: Some(text),
                    position: None,
                })
                .into_response()),
                // Cancellation is a normal outcome for the client, not a
                // server failure.
                Err(amcp_agent::AgentError::Cancelled) => Ok(Json(PromptResponse {
                    session_id,
                    message_id,
                    status: "cancelled".to_string(),
                    result: None,
                    position: None,
                })
                .into_response()),
                Err(error) => Err(ApiError::from(error)),
            }
        }

        PromptOutcome::Started { mut done, .. } => {
            let (tx, rx) = mpsc::channel::<std::result::Result<bytes::Bytes, std::convert::Infallible>>(64);
            let stream_session = session_id.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = bus_rx.recv() => {
                            match event {
                                Ok(event) => {
                                    if event.session_id.as_deref() != Some(stream_session.as_str()) {
                                        continue;
                                    }
                                    if let Some(chunk) = to_http_chunk(&event) {
                                        if tx.send(Ok(chunk.into())).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(_) => return,
                            }
                        }
                        _ = &mut done => {
                            // The prompt finished; its events were published
                            // before completion, so drain what is buffered
                            // and close the body.
                            while let Ok(event) = bus_rx.try_recv() {
                                if event.session_id.as_deref() != Some(stream_session.as_str()) {
                                    continue;
                                }
                                if let Some(chunk) = to_http_chunk(&event) {
                                    if tx.send(Ok(chunk.into())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            return;
                        }
                    }
                }
            });

            let body = Body::from_stream(ReceiverStream::new(rx));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .unwrap())
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CancelBody {
    #[serde(default)]
    force: bool,
}

async fn cancel_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<serde_json::Value>> {
    if !state.sessions().contains(&session_id).await {
        return Err(ApiError::session_not_found(&session_id));
    }

    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let cancelled = state.runtime.cancel(&session_id, force).await;

    let message = if cancelled {
        "cancellation requested"
    } else {
        "no active prompt"
    };
    Ok(Json(serde_json::json!({
        "message": message,
        "session_id": session_id,
    })))
}

#[derive(Debug, Deserialize)]
struct PermissionResponseBody {
    response: ApprovalResponse,
}

async fn respond_permission(
    State(state): State<Arc<ServerState>>,
    Path((session_id, request_id)): Path<(String, String)>,
    Json(body): Json<PermissionResponseBody>,
) -> Result<Json<serde_json::Value>> {
    if !state.sessions().contains(&session_id).await {
        return Err(ApiError::session_not_found(&session_id));
    }

    state
        .permissions()
        .respond(&request_id, body.response)
        .await
        .map_err(|e| ApiError::new(ErrorCode::NotFound, e.to_string()))?;

    Ok(Json(serde_json::json!({"acknowledged": true})))
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let schemas = state.tools().schemas().await;
    let total = schemas.len();
    let tools: Vec<serde_json::Value> = schemas
        .into_iter()
        .map(|schema| {
            serde_json::json!({
                "name": schema.name,
                "description": schema.description,
                "parameters": schema.parameters,
                "source": schema.source,
            })
        })
        .collect();
    Json(serde_json::json!({"tools": tools, "total": total}))
}

#[derive(Debug, Deserialize)]
struct ExecuteToolBody {
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Operator surface: run one tool outside any agent loop. Hooks and the
/// permission engine are deliberately not consulted here.
async fn execute_tool(
    State(state): State<Arc<ServerState>>,
    Path(tool_name): Path<String>,
    Json(body): Json<ExecuteToolBody>,
) -> Result<Json<serde_json::Value>> {
    let registry = state.tools();
    if registry.get(&tool_name).await.is_none() {
        return Err(ApiError::tool_not_found(&tool_name));
    }

    let cwd = state
        .config
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
        .to_string_lossy()
        .to_string();
    let ctx = ToolContext::new("adhoc", cwd);

    let result = registry.execute(&tool_name, body.arguments, ctx).await;
    let mut response = serde_json::json!({
        "success": result.success,
        "result": result.content,
    });
    if !result.success {
        response["error"] = serde_json::json!(result.content);
    }
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn list_agents(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let mut agents: Vec<serde_json::Value> = state
        .agents
        .values()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "description": spec.description,
                "mode": spec.mode,
                "tools_count": spec.tools.len(),
            })
        })
        .collect();
    agents.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    let total = agents.len();
    Json(serde_json::json!({"agents": agents, "total": total}))
}

async fn get_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let spec = state
        .agents
        .get(&agent_name)
        .ok_or_else(|| ApiError::agent_not_found(&agent_name))?;

    Ok(Json(serde_json::json!({
        "name": spec.name,
        "description": spec.description,
        "mode": spec.mode,
        "system_prompt": spec.system_prompt,
        "tools": spec.tools,
        "exclude_tools": spec.exclude_tools,
        "max_steps": spec.max_steps,
        "can_delegate": spec.can_delegate,
    })))
}
