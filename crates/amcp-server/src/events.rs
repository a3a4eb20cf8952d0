use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use amcp_protocol::to_sse_frame;
use amcp_types::{Event, EventKind};

use crate::error::{ApiError, Result};
use crate::state::ServerState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

static SSE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static WS_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub struct ConnectionCounts {
    pub sse: usize,
    pub websocket: usize,
}

pub fn connection_counts() -> ConnectionCounts {
    ConnectionCounts {
        sse: SSE_CONNECTIONS.load(Ordering::Relaxed),
        websocket: WS_CONNECTIONS.load(Ordering::Relaxed),
    }
}

pub(crate) fn ws_connected() {
    WS_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn ws_disconnected() {
    WS_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

/// `GET /events` — every event on the bus, as SSE.
pub async fn global_events(State(state): State<Arc<ServerState>>) -> Response {
    sse_response(state, None)
}

/// `GET /sessions/{id}/events` — SSE filtered to one session.
pub async fn session_events(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    if !state.sessions().contains(&session_id).await {
        return Err(ApiError::session_not_found(&session_id));
    }

    let sessions = state.sessions();
    sessions.adjust_connected_clients(&session_id, 1).await;
    Ok(sse_response(state, Some(session_id)))
}

fn sse_response(state: Arc<ServerState>, session_filter: Option<String>) -> Response {
    let mut bus_rx = state.bus().subscribe_channel();
    let (tx, rx) = mpsc::channel::<std::result::Result<bytes::Bytes, std::convert::Infallible>>(64);

    SSE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(async move {
        let _guard = SseGuard {
            state: Arc::clone(&state),
            session_id: session_filter.clone(),
        };

        // Clients learn their subscription is live before any event flows.
        let mut connected = Event::new(EventKind::Connected, serde_json::json!({}));
        connected.session_id = session_filter.clone();
        if tx.send(Ok(to_sse_frame(&connected).into())).await.is_err() {
            return;
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                event = bus_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(filter) = &session_filter {
                                if event.session_id.as_deref() != Some(filter.as_str()) {
                                    continue;
                                }
                            }
                            if tx.send(Ok(to_sse_frame(&event).into())).await.is_err() {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "sse client lagged behind the bus");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Event::new(EventKind::Heartbeat, serde_json::json!({}));
                    if tx.send(Ok(to_sse_frame(&beat).into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

/// Decrements the connection counters when the forwarding task ends.
struct SseGuard {
    state: Arc<ServerState>,
    session_id: Option<String>,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        if let Some(session_id) = self.session_id.take() {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                state
                    .sessions()
                    .adjust_connected_clients(&session_id, -1)
                    .await;
            });
        }
    }
}
