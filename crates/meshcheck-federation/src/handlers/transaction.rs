use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde_json::{json, Map, Value};

use super::{parse_body, PeerContext};
use crate::error::FederationError;
use crate::state::TransactionOutcome;

pub const SEND_TRANSACTION_PATH: &str = "/_matrix/federation/v1/send/{txn_id}";

/// `PUT /_matrix/federation/v1/send/{txnId}`
pub async fn receive_transaction(
    State(state): PeerContext,
    Path(txn_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, FederationError> {
    let body = parse_body(&body)?;
    let pdus = list(&body, "pdus")?;
    let edus = list(&body, "edus")?;
    let origin = body.get("origin").and_then(Value::as_str).unwrap_or("unknown");
    tracing::info!(%txn_id, origin, pdus = pdus.len(), edus = edus.len(), "received transaction");

    let outcome = state.handle_transaction(&pdus, &edus).await;
    Ok(Json(json!({ "pdus": outcome_json(&outcome) })))
}

fn list(body: &Value, key: &str) -> Result<Vec<Value>, FederationError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(FederationError::BadJson(format!("{key} must be an array"))),
    }
}

/// `{eventId: {}}` for accepted PDUs, `{eventId: {"error": ..}}` otherwise.
pub fn outcome_json(outcome: &TransactionOutcome) -> Value {
    let map: Map<String, Value> = outcome
        .iter()
        .map(|(event_id, result)| {
            let entry = match result {
                Ok(()) => json!({}),
                Err(reason) => json!({ "error": reason }),
            };
            (event_id.clone(), entry)
        })
        .collect();
    Value::Object(map)
}
