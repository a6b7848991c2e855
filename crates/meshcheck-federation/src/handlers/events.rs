use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use super::{known_room, now_ms, parse_body, PeerContext};
use crate::error::FederationError;

pub const EVENT_PATH: &str = "/_matrix/federation/v1/event/{event_id}";
pub const MISSING_EVENTS_PATH: &str = "/_matrix/federation/v1/get_missing_events/{room_id}";

const DEFAULT_MISSING_EVENTS_LIMIT: u64 = 10;

/// `GET /_matrix/federation/v1/event/{eventId}`
pub async fn get_event(
    State(state): PeerContext,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, FederationError> {
    for room in state.rooms() {
        if let Some(event) = room.lock().await.event(&event_id) {
            return Ok(Json(json!({
                "origin": state.server_name(),
                "origin_server_ts": now_ms(),
                "pdus": [event.json()],
            })));
        }
    }
    Err(FederationError::NotFound(format!("event {event_id} not found")))
}

/// `POST /_matrix/federation/v1/get_missing_events/{roomId}`
pub async fn get_missing_events(
    State(state): PeerContext,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, FederationError> {
    let room = known_room(&state, &room_id)?;
    let body = parse_body(&body)?;
    let earliest = id_list(&body, "earliest_events")?;
    let latest = id_list(&body, "latest_events")?;
    let limit = body
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MISSING_EVENTS_LIMIT) as usize;
    let min_depth = body.get("min_depth").and_then(Value::as_i64).unwrap_or(0);

    let events: Vec<Value> = room
        .lock()
        .await
        .events_between(&earliest, &latest, limit, min_depth)
        .iter()
        .map(|event| event.json().clone())
        .collect();
    tracing::info!(%room_id, returned = events.len(), "served get_missing_events");
    Ok(Json(json!({ "events": events })))
}

fn id_list(body: &Value, key: &str) -> Result<Vec<String>, FederationError> {
    body.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| FederationError::BadJson(format!("missing {key}")))?
        .iter()
        .map(|id| {
            id.as_str()
                .map(str::to_string)
                .ok_or_else(|| FederationError::BadJson(format!("{key} must hold event ids")))
        })
        .collect()
}
