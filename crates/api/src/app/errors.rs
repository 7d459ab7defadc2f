use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use fibernet_infra::outcome_log::OutcomeStoreError;
use fibernet_infra::sync::DispatchError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Repository(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "repository_error", e.to_string())
        }
        DispatchError::Marker(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "marker_unavailable", e.to_string())
        }
        DispatchError::Queue(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", e.to_string()),
    }
}

pub fn outcome_error_to_response(err: OutcomeStoreError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "outcome_store_error", err.to_string())
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
