use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::app::services::AppServices;

/// Liveness: the process is up and serving.
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "volitas"}))
}

/// Readiness: every pool's queue answers its probe in time.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let pools = services.health.report().await;
    let ready = pools.iter().all(|p| p.ready);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"ready": ready, "pools": pools})))
}

pub async fn routes(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.table.as_ref().clone())
}
