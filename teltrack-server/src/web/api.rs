//! HTTP API endpoints for ingestion and monitoring.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use teltrack_protocol::DeviceId;

use crate::database::PositionRecord;
use crate::web::WebState;

/// A position report submitted over HTTP by an external gateway.
#[derive(Debug, Deserialize)]
pub struct IngestReport {
    /// 15-digit device identifier.
    pub device_id: String,
    /// Fix time, `YYYY-MM-DD HH:MM:SS` UTC. Defaults to now.
    pub recorded_at: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_kmh: u8,
    #[serde(default)]
    pub course: u16,
    #[serde(default)]
    pub satellites: u8,
    #[serde(default)]
    pub acc_on: bool,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub id: i64,
    pub device_id: String,
}

/// Accept a JSON position report from an external gateway.
pub async fn ingest_position(
    State(state): State<WebState>,
    Json(report): Json<IngestReport>,
) -> impl IntoResponse {
    let device_id = match parse_device_id(&report.device_id) {
        Ok(id) => id,
        Err(msg) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
    };
    if !(-90.0..=90.0).contains(&report.latitude)
        || !(-180.0..=180.0).contains(&report.longitude)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "coordinates out of range" })),
        )
            .into_response();
    }

    let recorded_at = match &report.recorded_at {
        Some(s) => match NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            Ok(ts) => ts,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "recorded_at must be YYYY-MM-DD HH:MM:SS" })),
                )
                    .into_response()
            }
        },
        None => Utc::now().naive_utc(),
    };

    let record = PositionRecord {
        device_id,
        recorded_at,
        latitude: report.latitude,
        longitude: report.longitude,
        speed_kmh: report.speed_kmh,
        course: report.course,
        satellites: report.satellites,
        acc_on: report.acc_on,
    };

    let db = state.database.lock().await;
    match db.insert_position(&record) {
        Ok(id) => (
            StatusCode::OK,
            Json(IngestResponse {
                id,
                device_id: device_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            log::error!("Ingestion insert failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage failure" })),
            )
                .into_response()
        }
    }
}

/// List all registered devices.
pub async fn get_devices(State(state): State<WebState>) -> impl IntoResponse {
    let db = state.database.lock().await;
    match db.list_devices() {
        Ok(devices) => (StatusCode::OK, Json(json!({ "devices": devices }))).into_response(),
        Err(e) => {
            log::error!("Device listing failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage failure" })),
            )
                .into_response()
        }
    }
}

/// Latest known position for one device, preferring the in-memory
/// registry over the database.
pub async fn get_device_position(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let device_id = match parse_device_id(&id) {
        Ok(id) => id,
        Err(msg) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
    };

    if let Some(entry) = state.registry.lookup(device_id).await {
        if let Some(position) = entry.last_position {
            return (
                StatusCode::OK,
                Json(json!({ "source": "live", "position": position })),
            )
                .into_response();
        }
    }

    let db = state.database.lock().await;
    match db.latest_position(device_id) {
        Ok(Some(position)) => (
            StatusCode::OK,
            Json(json!({ "source": "stored", "position": position })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no position recorded" })),
        )
            .into_response(),
        Err(e) => {
            log::error!("Position lookup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage failure" })),
            )
                .into_response()
        }
    }
}

/// Connection statistics.
pub async fn get_stats(State(state): State<WebState>) -> impl IntoResponse {
    let connected = state.registry.connected_count().await;
    let known = state.registry.known_count().await;
    Json(json!({
        "connected_devices": connected,
        "known_devices": known,
    }))
}

fn parse_device_id(raw: &str) -> Result<DeviceId, &'static str> {
    let value: u64 = raw
        .parse()
        .map_err(|_| "device_id must be a decimal identifier")?;
    DeviceId::new(value).map_err(|_| "device_id out of range")
}
