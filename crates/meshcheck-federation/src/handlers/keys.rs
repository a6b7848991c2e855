use axum::{extract::State, Json};
use serde_json::Value;

use super::{now_ms, PeerContext};
use crate::error::FederationError;

pub const SERVER_KEYS_PATH: &str = "/_matrix/key/v2/server";

/// `GET /_matrix/key/v2/server`
pub async fn get_server_keys(State(state): PeerContext) -> Result<Json<Value>, FederationError> {
    let document = state.identity().key_document(now_ms())?;
    Ok(Json(document))
}
