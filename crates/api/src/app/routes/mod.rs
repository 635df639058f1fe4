use axum::{routing::get, Router};

pub mod dead_letters;
pub mod jobs;
pub mod system;

/// Router for the job and operator endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/routes", get(system::routes))
        .nest("/jobs", jobs::router())
        .nest("/dead-letters", dead_letters::router())
}
