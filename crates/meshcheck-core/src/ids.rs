//! Helpers for the `sigil localpart:server` identifier grammar shared by
//! users, rooms, aliases and events.

/// Build a user id on `server_name`. A leading `@` on `localpart` is accepted.
pub fn user_id(localpart: &str, server_name: &str) -> String {
    format!("@{}:{}", localpart.trim_start_matches('@'), server_name)
}

/// Build a room alias on `server_name`. A leading `#` on `localpart` is accepted.
pub fn room_alias(localpart: &str, server_name: &str) -> String {
    format!("#{}:{}", localpart.trim_start_matches('#'), server_name)
}

/// Build a room id from an opaque local part.
pub fn room_id(opaque: &str, server_name: &str) -> String {
    format!("!{}:{}", opaque.trim_start_matches('!'), server_name)
}

/// The server name portion of a sigilled id. Server names may carry a port,
/// so only the first `:` separates the localpart.
pub fn server_name_of(id: &str) -> Option<&str> {
    let (_, server) = id.split_once(':')?;
    if server.is_empty() {
        None
    } else {
        Some(server)
    }
}

pub fn localpart_of(id: &str) -> Option<&str> {
    let (local, _) = id.split_once(':')?;
    local.get(1..)
}
