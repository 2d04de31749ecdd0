pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use turnstile_common::AppConfig;
use turnstile_gate::Gate;

pub use state::{AppState, SharedState};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health_check))
        .route("/api/status", get(routes::status::get_status))
        .route(
            "/api/identities/{id}",
            get(routes::identities::get_identity),
        )
        .route("/api/config", get(routes::config::get_config))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// Runs until the server fails or the returned future is dropped.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn new_shared_state(config: AppConfig, gate: Arc<Gate>) -> SharedState {
    Arc::new(AppState::new(config, gate))
}
