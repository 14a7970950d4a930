//! Operator endpoints: dead letters and runtime statistics.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::dto::{DeadLettersQuery, MAX_PAGE_SIZE, StatsResponse};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:message_id/redrive", post(redrive))
        .route("/stats", get(stats))
}

/// GET /admin/dead-letters?limit=
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DeadLettersQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    match services.queue.dead_letters(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_error", e.to_string()),
    }
}

/// POST /admin/dead-letters/:message_id/redrive
pub async fn redrive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(message_id): Path<String>,
) -> axum::response::Response {
    let message_id = match errors::parse_message_id(&message_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.submissions.redrive(message_id).await {
        Ok(new_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "messageId": new_id })),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /admin/stats
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.status.stats().await {
        Ok(jobs) => jobs,
        Err(e) => return errors::status_error_to_response(e),
    };
    let queue = match services.queue.stats().await {
        Ok(queue) => queue,
        Err(e) => {
            return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_error", e.to_string());
        }
    };
    Json(StatsResponse {
        jobs,
        queue,
        workers: services.worker_stats(),
    })
    .into_response()
}
