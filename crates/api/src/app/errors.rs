use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use hostpilot_infra::store::OperationStoreError;

pub fn store_error_to_response(err: OperationStoreError) -> axum::response::Response {
    match err {
        OperationStoreError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("operation {id} not found"),
        ),
        OperationStoreError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        OperationStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
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
