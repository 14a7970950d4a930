use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use timetable_core::{JobId, MessageId};
use timetable_infra::jobs::{StatusError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        SubmitError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        SubmitError::MessageNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead-letter message {id} not found"),
        ),
        e @ SubmitError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        SubmitError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        SubmitError::Queue(e) => {
            tracing::error!(error = %e, "work queue failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_error", e.to_string())
        }
    }
}

pub fn status_error_to_response(err: StatusError) -> axum::response::Response {
    match err {
        StatusError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        e @ StatusError::NotCompleted { .. } => {
            json_error(StatusCode::CONFLICT, "not_completed", e.to_string())
        }
        StatusError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
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

pub fn bad_request(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, code, message)
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| bad_request("invalid_job_id", format!("'{s}' is not a job id")))
}

pub fn parse_message_id(s: &str) -> Result<MessageId, axum::response::Response> {
    s.parse()
        .map_err(|_| bad_request("invalid_message_id", format!("'{s}' is not a message id")))
}
