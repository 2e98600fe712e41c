use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use hostpilot_core::{OperationId, OperationSource, OperationStatus};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue).get(list))
        .route("/stats", get(stats))
        .route("/:id", get(status))
}

/// Accept a new operation. Everything entering through this boundary is
/// `source=api`; the unrelated ui path writes its rows through its own
/// channel.
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueRequest>,
) -> axum::response::Response {
    if body.op_type.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_type",
            "operation type must not be empty",
        );
    }

    match services
        .store
        .enqueue(&body.op_type, body.data, OperationSource::Api)
        .await
    {
        Ok(op) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "id": op.id.to_string(),
                "status": "accepted",
            })),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Status lookup. Falls back to the archive so history stays queryable after
/// the daily sweep.
pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: OperationId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                "invalid operation id",
            )
        }
    };

    match services.store.get(id).await {
        Ok(Some(op)) => {
            (StatusCode::OK, Json(dto::operation_to_json(&op, false))).into_response()
        }
        Ok(None) => match services.store.get_archived(id).await {
            Ok(Some(op)) => {
                (StatusCode::OK, Json(dto::operation_to_json(&op, true))).into_response()
            }
            Ok(None) => {
                errors::json_error(StatusCode::NOT_FOUND, "not_found", "operation not found")
            }
            Err(e) => errors::store_error_to_response(e),
        },
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let Some(status) = query.status else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "missing_status",
            "status query parameter is required",
        );
    };
    let status: OperationStatus = match status.parse() {
        Ok(s) => s,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string())
        }
    };
    let limit = query.limit.unwrap_or(50);

    match services.store.list_by_status(status, limit).await {
        Ok(ops) => {
            let items: Vec<_> = ops
                .iter()
                .map(|op| dto::operation_to_json(op, false))
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// The watchdog's daily numbers, on demand (trailing 24 hours).
pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services
        .store
        .stats(Utc::now() - chrono::Duration::hours(24))
        .await
    {
        Ok(stats) => (StatusCode::OK, Json(dto::stats_to_json(&stats))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
