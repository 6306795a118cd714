//! HTTP surface: router construction and server lifecycle.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::models::GatewayConfig;
use crate::proxy::handlers;
use crate::proxy::middleware::auth_middleware;
use crate::proxy::PoolManager;

/// Request body cap: 10 MiB.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub config: Arc<GatewayConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route("/count_tokens", post(handlers::claude::handle_count_tokens))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude::handle_count_tokens),
        )
        .route(
            "/provider_health",
            get(handlers::claude::handle_provider_health),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::claude::handle_health))
        .route("/healthz", get(handlers::claude::handle_health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    let addr = format!("{}:{}", state.config.host, state.config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;

    info!("Gateway listening on {}", addr);

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("server error: {}", e))
}
