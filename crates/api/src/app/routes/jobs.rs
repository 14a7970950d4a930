//! Job submission, status, results and cancellation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::app::dto::{CancelJobRequest, ListJobsQuery, SubmitJobRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/:id/status", get(job_status))
        .route("/:id/events", get(job_events))
        .route("/:id/results", get(job_results))
        .route("/:id/cancel", post(cancel_job))
}

/// POST /jobs
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::bad_request("invalid_body", rejection.body_text()),
    };

    match services.submissions.submit(body.into()).await {
        Ok(submitted) => (StatusCode::ACCEPTED, Json(submitted)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs?status=&schoolId=&limit=&offset=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(resp) => return resp,
    };
    match services.status.list(&filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

/// GET /jobs/:id/status
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.status.get_status(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

/// GET /jobs/:id/events
///
/// Server-sent `status` events, one per observed change, until the job is terminal.
pub async fn job_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = services.status.get_status(job_id).await {
        return errors::status_error_to_response(e);
    }

    let (rx, _poll_task) = services
        .poller
        .spawn(job_id, services.shutdown_token().child_token());
    let stream = ReceiverStream::new(rx)
        .map(|view| SseEvent::default().event("status").json_data(&view));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// GET /jobs/:id/results
pub async fn job_results(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.status.get_results(job_id).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<CancelJobRequest>>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = body.and_then(|Json(body)| body.reason);

    match services.submissions.cancel(job_id, reason).await {
        Ok(request) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "jobId": job_id,
                "requestedAt": request.requested_at,
                "reason": request.reason,
            })),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
