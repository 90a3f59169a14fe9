use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use relaykit_store::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::InvalidInput(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        StoreError::Constraint(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Storage { .. } => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        ),
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
