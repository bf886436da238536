// File: orchestrator/src/web/server.rs
use crate::web::{handlers, AppState};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub async fn start_web_server(state: AppState) -> Result<()> {
    let app = create_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server running on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // === OPERATION ROUTES ===
        .route("/api/operations", get(handlers::list_operations))
        .route("/api/operations/{id}", get(handlers::get_operation))
        .route(
            "/api/operations/{id}/cancel",
            post(handlers::cancel_operation),
        )
        .route(
            "/api/operations/cleanup",
            post(handlers::cleanup_operations),
        )
        // === POOL ROUTES ===
        .route("/api/pools", get(handlers::list_pools))
        .route(
            "/api/pools/{pool}/network",
            post(handlers::reconfigure_network),
        )
        .route(
            "/api/pools/{pool}/detach-storage",
            post(handlers::detach_storage),
        )
        .route(
            "/api/pools/{pool}/storage/{sr}/scan",
            post(handlers::scan_storage),
        )
        // === SCAN QUEUE ROUTES ===
        .route("/api/scans", get(handlers::get_scan_status))
        // Add middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
