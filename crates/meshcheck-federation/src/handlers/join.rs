use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    Json,
};
use meshcheck_events::{Event, EventTemplate};
use serde_json::{json, Value};

use super::{known_room, parse_body, PeerContext};
use crate::error::FederationError;
use crate::state::PeerState;

pub const MAKE_JOIN_PATH: &str = "/_matrix/federation/v1/make_join/{room_id}/{user_id}";
pub const SEND_JOIN_PATH: &str = "/_matrix/federation/v2/send_join/{room_id}/{event_id}";

/// `GET /_matrix/federation/v1/make_join/{roomId}/{userId}`
pub async fn make_join(
    State(state): PeerContext,
    Path((room_id, user_id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, FederationError> {
    make_membership(&state, &room_id, &user_id, query.as_deref(), "join").await
}

/// `PUT /_matrix/federation/v2/send_join/{roomId}/{eventId}`
pub async fn send_join(
    State(state): PeerContext,
    Path((room_id, event_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, FederationError> {
    let accepted = accept_membership(&state, &room_id, &event_id, &body, "join").await?;
    Ok(Json(json!({
        "origin": state.server_name(),
        "state": accepted.state,
        "auth_chain": accepted.auth_chain,
        "event": accepted.event.json(),
        "members_omitted": false,
    })))
}

/// `ver` parameters from a make_join/make_knock query. `None` when the
/// caller sent none.
pub(crate) fn requested_versions(query: Option<&str>) -> Option<Vec<String>> {
    let versions: Vec<String> = url::form_urlencoded::parse(query?.as_bytes())
        .filter(|(key, _)| key == "ver")
        .map(|(_, value)| value.into_owned())
        .collect();
    if versions.is_empty() {
        None
    } else {
        Some(versions)
    }
}

/// Proto membership event built on the room's current extremities.
pub(crate) async fn make_membership(
    state: &PeerState,
    room_id: &str,
    user_id: &str,
    query: Option<&str>,
    membership: &str,
) -> Result<Json<Value>, FederationError> {
    let room = known_room(state, room_id)?;
    let version = room.version();
    if let Some(versions) = requested_versions(query) {
        if !versions.iter().any(|v| v == version.id) {
            return Err(FederationError::IncompatibleRoomVersion {
                room_version: version.id.to_string(),
            });
        }
    }
    if membership == "knock" && !version.knocking {
        return Err(FederationError::IncompatibleRoomVersion {
            room_version: version.id.to_string(),
        });
    }

    let template = EventTemplate::member(user_id, user_id, membership);
    let proto = room.lock().await.build_event(state.identity(), &template)?.proto_json();
    tracing::info!(room_id, user_id, membership, "served make_{membership}");
    Ok(Json(json!({
        "event": proto,
        "room_version": version.id,
    })))
}

pub(crate) struct AcceptedMembership {
    pub(crate) event: Event,
    /// Room state before the event, as federation JSON.
    pub(crate) state: Vec<Value>,
    pub(crate) auth_chain: Vec<Value>,
    pub(crate) stripped_state: Vec<Value>,
}

/// Check a signed membership event from the remote server and append it.
pub(crate) async fn accept_membership(
    state: &PeerState,
    room_id: &str,
    event_id: &str,
    body: &Bytes,
    membership: &str,
) -> Result<AcceptedMembership, FederationError> {
    let room = known_room(state, room_id)?;
    let pdu = parse_body(body)?;
    let event = Event::from_pdu(room.version(), &pdu)?;
    if event.event_id() != event_id {
        return Err(FederationError::BadJson(format!(
            "event id {} does not match {event_id}",
            event.event_id()
        )));
    }
    if event.room_id() != room_id {
        return Err(FederationError::BadJson(format!(
            "event belongs to {}, not {room_id}",
            event.room_id()
        )));
    }
    if event.membership() != Some(membership) || event.state_key() != Some(event.sender()) {
        return Err(FederationError::BadJson(format!(
            "expected a {membership} membership event for its sender"
        )));
    }

    let mut guard = room.lock().await;
    let current: Vec<Event> = guard.current_state().into_iter().cloned().collect();
    let auth_ids: BTreeSet<String> = current
        .iter()
        .chain(std::iter::once(&event))
        .flat_map(|ev| ev.auth_events().iter().cloned())
        .collect();
    let auth_ids: Vec<String> = auth_ids.into_iter().collect();
    let auth_chain = guard.auth_chain(&auth_ids);
    let stripped_state = guard.stripped_state();
    guard.add_event(event.clone())?;
    drop(guard);

    tracing::info!(room_id, event_id, sender = event.sender(), "accepted send_{membership}");
    Ok(AcceptedMembership {
        state: current.iter().map(|ev| ev.json().clone()).collect(),
        auth_chain: auth_chain.iter().map(|ev| ev.json().clone()).collect(),
        stripped_state,
        event,
    })
}
