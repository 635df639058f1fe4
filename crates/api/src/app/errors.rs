use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use volitas_core::{JobId, RouteError};
use volitas_infra::StoreError;
use volitas_infra::dead_letter::RequeueError;

pub fn route_error_to_response(err: RouteError) -> axum::response::Response {
    match err {
        RouteError::UnknownJobKind(kind) => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unknown_job_kind",
            format!("no queue is configured for job kind {kind}"),
        ),
        RouteError::QueueUnavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Serialization(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg),
        StoreError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
    }
}

pub fn requeue_error_to_response(err: RequeueError) -> axum::response::Response {
    match err {
        RequeueError::NotFound(id) => job_not_found(id),
        RequeueError::Store(e) => store_error_to_response(e),
        RequeueError::Route(e) => route_error_to_response(e),
    }
}

pub fn job_not_found(id: JobId) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_job_id", format!("{raw:?} is not a job id")))
}
