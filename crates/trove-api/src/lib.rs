//! Local HTTP control endpoint for a trove peer.

pub mod handlers;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/backup", post(handlers::handle_backup))
        .route("/restore", post(handlers::handle_restore))
        .route("/delete", post(handlers::handle_delete))
        .route("/reclaim", post(handlers::handle_reclaim))
        .route("/state", get(handlers::handle_state))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "control API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
