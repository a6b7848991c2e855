use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::PeerContext;
use crate::error::FederationError;

pub const QUERY_DIRECTORY_PATH: &str = "/_matrix/federation/v1/query/directory";

#[derive(Debug, Deserialize)]
pub struct DirectoryQuery {
    pub room_alias: String,
}

/// `GET /_matrix/federation/v1/query/directory?room_alias=`
pub async fn query_directory(
    State(state): PeerContext,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<Value>, FederationError> {
    let room_id = state
        .resolve_alias(&query.room_alias)
        .ok_or_else(|| FederationError::NotFound(format!("room alias {} not found", query.room_alias)))?;
    Ok(Json(json!({
        "room_id": room_id,
        "servers": [state.server_name()],
    })))
}
