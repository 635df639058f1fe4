use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use volitas_core::IdempotencyKey;

use crate::app::dto::{SubmitJobRequest, SubmitJobResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/:id", get(status))
}

async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<SubmitJobRequest>,
) -> axum::response::Response {
    let key = req.idempotency_key.map(IdempotencyKey::new);
    match services.jobs.submit(req.kind, req.payload, key).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })).into_response(),
        Err(e) => errors::route_error_to_response(e),
    }
}

async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.jobs.status(id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => errors::job_not_found(id),
        Err(e) => errors::store_error_to_response(e),
    }
}
