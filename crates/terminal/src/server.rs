//! HTTP surface: health probe and the terminal WebSocket.

use std::net::SocketAddr;

use {
    axum::{Json, Router, extract::State, response::IntoResponse, routing::get},
    tokio::net::TcpListener,
    tower_http::trace::TraceLayer,
    tracing::info,
};

use crate::session::{TerminalService, terminal_ws_handler};

/// Build the router (shared between `labrun serve` and tests).
pub fn build_router(service: TerminalService) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws/terminal", get(terminal_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve on `bind:port` until Ctrl-C.
pub async fn serve(bind: &str, port: u16, service: TerminalService) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "terminal server listening");
    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await
}

async fn health_handler(State(service): State<TerminalService>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_terminals": service.active_sessions(),
        "max_terminals": service.settings().max_sessions,
    }))
}
