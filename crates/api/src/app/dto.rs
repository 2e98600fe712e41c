//! Request DTOs and JSON mapping helpers.

use serde::Deserialize;

use hostpilot_core::Operation;
use hostpilot_infra::store::OperationStats;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub fn operation_to_json(op: &Operation, archived: bool) -> serde_json::Value {
    let mut value = serde_json::json!({
        "id": op.id.to_string(),
        "type": op.op_type,
        "status": op.status.as_str(),
        "source": op.source.as_str(),
        "retry_count": op.retry_count,
        "error": op.error,
        "result": op.result,
        "created_at": op.created_at.to_rfc3339(),
        "started_at": op.started_at.map(|t| t.to_rfc3339()),
        "completed_at": op.completed_at.map(|t| t.to_rfc3339()),
    });
    if archived {
        value["archived"] = serde_json::Value::Bool(true);
    }
    value
}

pub fn stats_to_json(stats: &OperationStats) -> serde_json::Value {
    serde_json::json!({
        "pending": stats.pending,
        "processing": stats.processing,
        "completed": stats.completed,
        "failed": stats.failed,
        "mean_completed_duration_ms": stats.mean_completed_duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use hostpilot_core::{OperationSource, TerminalOutcome};

    use super::*;

    #[test]
    fn enqueue_request_maps_type_field() {
        let req: EnqueueRequest = serde_json::from_value(json!({
            "type": "site.create",
            "data": {"domain_name": "example.com"}
        }))
        .unwrap();
        assert_eq!(req.op_type, "site.create");
        assert_eq!(req.data, json!({"domain_name": "example.com"}));

        // data is optional
        let bare: EnqueueRequest =
            serde_json::from_value(json!({"type": "maintenance.backup"})).unwrap();
        assert_eq!(bare.data, serde_json::Value::Null);
    }

    #[test]
    fn operation_json_carries_lifecycle_fields() {
        let mut op = Operation::new("site.create", json!({}), OperationSource::Api);
        let now = Utc::now();
        op.mark_processing(now).unwrap();
        op.mark_terminal(TerminalOutcome::completed(json!({"site_id": 1})), now)
            .unwrap();

        let value = operation_to_json(&op, false);
        assert_eq!(value["status"], "completed");
        assert_eq!(value["result"], json!({"site_id": 1}));
        assert_eq!(value["source"], "api");
        assert!(value.get("archived").is_none());

        let archived = operation_to_json(&op, true);
        assert_eq!(archived["archived"], true);
    }
}
