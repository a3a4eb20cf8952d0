use axum::http::{header::HeaderValue, request::Parts};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use amcp_types::{Event, EventKind};

use crate::routes;
use crate::state::ServerState;

fn is_allowed_origin(origin: &str, extra: &[String]) -> bool {
    origin.starts_with("http://localhost:")
        || origin.starts_with("http://127.0.0.1:")
        || extra.iter().any(|allowed| allowed == origin)
}

fn cors_layer(extra_origins: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin
                    .to_str()
                    .map(|o| is_allowed_origin(o, &extra_origins))
                    .unwrap_or(false)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve until ctrl-c, then drain: emit the shutdown event, give in-flight
/// prompts the configured grace, and force-cancel whatever remains.
pub async fn run_server(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let app = routes::router(Arc::clone(&state))
        .layer(cors_layer(state.config.cors_origins.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            drain(shutdown_state).await;
        })
        .await?;

    Ok(())
}

async fn drain(state: Arc<ServerState>) {
    tracing::info!("shutdown requested, draining sessions");
    state
        .bus()
        .emit(Event::new(EventKind::Shutdown, serde_json::json!({})))
        .await;

    let grace = Duration::from_secs(state.config.shutdown_grace_secs);
    let deadline = tokio::time::Instant::now() + grace;
    let sessions = state.sessions();

    loop {
        let infos = sessions.list().await;
        let running: Vec<String> = {
            let mut running = Vec::new();
            for info in &infos {
                if state.runtime.is_running(&info.id).await {
                    running.push(info.id.clone());
                }
            }
            running
        };

        if running.is_empty() {
            tracing::info!("all sessions drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(count = running.len(), "grace elapsed, force-cancelling");
            for session_id in running {
                state.runtime.cancel(&session_id, true).await;
            }
            return;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
