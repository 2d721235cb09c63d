//! HTTP server for position ingestion and read-only monitoring.
//!
//! The ingestion endpoint is independent of the TCP protocol path: it
//! accepts JSON position reports from gateways that have already parsed
//! terminal traffic elsewhere, and shares nothing with live sessions
//! except the database.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::database::DatabaseHandle;
use crate::registry::DeviceRegistry;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct WebState {
    pub database: DatabaseHandle,
    pub registry: Arc<DeviceRegistry>,
}

/// Build the HTTP router.
pub fn build_router(database: DatabaseHandle, registry: Arc<DeviceRegistry>) -> Router {
    let state = WebState { database, registry };

    Router::new()
        .route("/ingest", post(api::ingest_position))
        .route("/api/devices", get(api::get_devices))
        .route("/api/device/:id/position", get(api::get_device_position))
        .route("/api/stats", get(api::get_stats))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the HTTP server.
pub async fn start_web_server(
    listen_addr: SocketAddr,
    database: DatabaseHandle,
    registry: Arc<DeviceRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(database, registry);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Ingestion endpoint listening on http://{}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
