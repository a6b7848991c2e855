use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    Json,
};
use serde_json::{json, Value};

use super::join::{accept_membership, make_membership};
use super::PeerContext;
use crate::error::FederationError;

pub const MAKE_KNOCK_PATH: &str = "/_matrix/federation/v1/make_knock/{room_id}/{user_id}";
pub const SEND_KNOCK_PATH: &str = "/_matrix/federation/v1/send_knock/{room_id}/{event_id}";

/// `GET /_matrix/federation/v1/make_knock/{roomId}/{userId}`
pub async fn make_knock(
    State(state): PeerContext,
    Path((room_id, user_id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, FederationError> {
    make_membership(&state, &room_id, &user_id, query.as_deref(), "knock").await
}

/// `PUT /_matrix/federation/v1/send_knock/{roomId}/{eventId}`
pub async fn send_knock(
    State(state): PeerContext,
    Path((room_id, event_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, FederationError> {
    let accepted = accept_membership(&state, &room_id, &event_id, &body, "knock").await?;
    Ok(Json(json!({ "knock_room_state": accepted.stripped_state })))
}
