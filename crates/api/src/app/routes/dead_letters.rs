//! Operator endpoints over the dead letter sink.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::app::dto::DeadLetterSummary;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/:id", get(detail))
        .route("/:id/requeue", post(requeue))
}

async fn list(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.dead_letters.list().await {
        Ok(records) => Json(records.iter().map(DeadLetterSummary::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Full record including the attempt history.
async fn detail(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.dead_letters.get(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::job_not_found(id),
        Err(e) => errors::store_error_to_response(e),
    }
}

async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.dead_letters.requeue(id).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "dead_job_id": id,
                "job_id": receipt.job_id(),
                "duplicate": receipt.is_duplicate(),
            })),
        )
            .into_response(),
        Err(e) => errors::requeue_error_to_response(e),
    }
}
