//! Optional HTTP debug endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::{error, info};

use crate::manager::SessionManager;

#[derive(Debug, Serialize)]
struct DebugInfo {
    server_id: u8,
    chain_type: String,
    sessions: usize,
}

async fn debug_sessions(State(manager): State<Arc<SessionManager>>) -> Json<DebugInfo> {
    Json(DebugInfo {
        server_id: manager.server_id(),
        chain_type: manager.chain_type().to_string(),
        sessions: manager.session_count(),
    })
}

/// Serves `GET /debug/sessions` on the configured address.
pub fn spawn_debug_server(manager: Arc<SessionManager>, listen_addr: String) {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/debug/sessions", get(debug_sessions))
            .with_state(manager);

        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("HTTP debug bind failed: {}: {}", listen_addr, e);
                return;
            }
        };
        info!("HTTP debug enabled: {}", listen_addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP debug server failed: {}", e);
        }
    });
}
