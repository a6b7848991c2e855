pub mod directory;
pub mod events;
pub mod invite;
pub mod join;
pub mod keys;
pub mod knock;
pub mod transaction;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::error::FederationError;
use crate::state::{PeerState, RoomHandle};

pub type PeerContext = State<Arc<PeerState>>;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn parse_body(body: &Bytes) -> Result<Value, FederationError> {
    serde_json::from_slice(body).map_err(|e| FederationError::NotJson(format!("request body is not json: {e}")))
}

pub(crate) fn known_room(state: &PeerState, room_id: &str) -> Result<RoomHandle, FederationError> {
    state
        .room(room_id)
        .ok_or_else(|| FederationError::NotFound(format!("unknown room {room_id}")))
}

/// Answer for any request no route matched.
pub async fn unmatched(State(state): PeerContext, method: Method, uri: Uri) -> Response {
    let request = format!("{method} {uri}");
    if state.unexpected_requests_are_errors() {
        tracing::error!(%request, "federation peer received unexpected request");
        state.record_unexpected(request.clone());
        FederationError::Unrecognized(format!("unrecognised request {request}")).into_response()
    } else {
        tracing::debug!(%request, "answering unmatched request with empty success");
        (StatusCode::OK, Json(json!({}))).into_response()
    }
}
