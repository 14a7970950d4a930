use axum::Router;

pub mod admin;
pub mod jobs;
pub mod system;

/// Router for all API endpoints except the health probe.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/admin", admin::router())
}
