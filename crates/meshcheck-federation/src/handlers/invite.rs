use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use meshcheck_core::ids::server_name_of;
use meshcheck_events::{Event, RoomVersion};
use serde_json::{json, Value};

use super::{parse_body, PeerContext};
use crate::error::FederationError;

pub const INVITE_PATH: &str = "/_matrix/federation/v2/invite/{room_id}/{event_id}";

/// `PUT /_matrix/federation/v2/invite/{roomId}/{eventId}`
///
/// Co-signs invites for users on this server and hands them to the invite
/// callback before answering.
pub async fn receive_invite(
    State(state): PeerContext,
    Path((room_id, event_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, FederationError> {
    let body = parse_body(&body)?;
    let version_id = body
        .get("room_version")
        .and_then(Value::as_str)
        .ok_or_else(|| FederationError::BadJson("missing room_version".into()))?;
    let version = RoomVersion::parse(version_id)?;
    let pdu = body
        .get("event")
        .ok_or_else(|| FederationError::BadJson("missing event".into()))?;

    let mut event = Event::from_pdu(version, pdu)?;
    if event.event_id() != event_id || event.room_id() != room_id {
        return Err(FederationError::BadJson(format!(
            "invite {} for {} does not match the request path",
            event.event_id(),
            event.room_id()
        )));
    }
    if event.membership() != Some("invite") {
        return Err(FederationError::BadJson("event is not an invite".into()));
    }
    let invitee = event.state_key().unwrap_or_default().to_string();
    if server_name_of(&invitee) != Some(state.server_name()) {
        return Err(FederationError::Forbidden(format!(
            "{invitee} is not a user on {}",
            state.server_name()
        )));
    }

    event.add_signature(state.identity())?;
    state.remember_invite(&room_id, version);
    tracing::info!(%room_id, %event_id, %invitee, sender = event.sender(), "received invite");
    if let Some(callback) = &state.callbacks.on_invite {
        callback(&event);
    }
    Ok(Json(json!({ "event": event.json() })))
}
