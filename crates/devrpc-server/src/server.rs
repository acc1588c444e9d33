//! HTTP status surface using Axum.

use crate::handler::{handle_broadcast, handle_health, handle_peers, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use devrpc_core::{HotHubHandle, RpcServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// RPC surface over every connected tool
    pub rpc: RpcServer,
    /// Hot channel hub the tools connect to
    pub hub: HotHubHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/peers", get(handle_peers))
        .route("/rpc", post(handle_rpc))
        .route("/broadcast", post(handle_broadcast))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions;
    use devrpc_core::{create_rpc_server, HotHub, RpcOptions};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_starts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();

        let hub = HotHub::start("127.0.0.1:0").await.unwrap();
        let rpc = create_rpc_server(
            "devrpc",
            &hub,
            functions::registry(root),
            RpcOptions::default(),
        );
        let state = Arc::new(AppState { rpc, hub });

        let addr = start_server(state, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }
}
