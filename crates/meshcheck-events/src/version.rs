use crate::error::EventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdFormat {
    /// Standard base64 of the reference hash.
    Base64,
    /// URL-safe base64 of the reference hash.
    UrlSafeBase64,
}

/// The rule set a room was created under. Only the properties the emulator
/// needs to shape, hash and authorise events are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomVersion {
    pub id: &'static str,
    pub event_id_format: EventIdFormat,
    /// No floats, integers within ±(2^53 - 1).
    pub strict_canonical_json: bool,
    pub knocking: bool,
    pub restricted_joins: bool,
    pub knock_restricted: bool,
    /// `m.room.aliases` content survives redaction.
    pub redaction_keeps_aliases: bool,
    /// `join_authorised_via_users_server` survives redaction.
    pub redaction_keeps_authorising_user: bool,
    /// Redaction rules introduced in v11.
    pub updated_redaction_rules: bool,
}

const BASE: RoomVersion = RoomVersion {
    id: "3",
    event_id_format: EventIdFormat::Base64,
    strict_canonical_json: false,
    knocking: false,
    restricted_joins: false,
    knock_restricted: false,
    redaction_keeps_aliases: true,
    redaction_keeps_authorising_user: false,
    updated_redaction_rules: false,
};

pub const V3: RoomVersion = BASE;
pub const V4: RoomVersion = RoomVersion {
    id: "4",
    event_id_format: EventIdFormat::UrlSafeBase64,
    ..BASE
};
pub const V5: RoomVersion = RoomVersion { id: "5", ..V4 };
pub const V6: RoomVersion = RoomVersion {
    id: "6",
    strict_canonical_json: true,
    redaction_keeps_aliases: false,
    ..V5
};
pub const V7: RoomVersion = RoomVersion {
    id: "7",
    knocking: true,
    ..V6
};
pub const V8: RoomVersion = RoomVersion {
    id: "8",
    restricted_joins: true,
    ..V7
};
pub const V9: RoomVersion = RoomVersion {
    id: "9",
    redaction_keeps_authorising_user: true,
    ..V8
};
pub const V10: RoomVersion = RoomVersion {
    id: "10",
    knock_restricted: true,
    ..V9
};
pub const V11: RoomVersion = RoomVersion {
    id: "11",
    updated_redaction_rules: true,
    ..V10
};
/// Experimental `knock_restricted` join rule on top of v9.
pub const MSC3787: RoomVersion = RoomVersion {
    id: "org.matrix.msc3787",
    knock_restricted: true,
    ..V9
};

pub const SUPPORTED: &[RoomVersion] = &[V3, V4, V5, V6, V7, V8, V9, V10, V11, MSC3787];

/// Version used when the caller does not pick one.
pub const DEFAULT: RoomVersion = V10;

impl RoomVersion {
    pub fn parse(id: &str) -> Result<&'static RoomVersion, EventError> {
        SUPPORTED
            .iter()
            .find(|version| version.id == id)
            .ok_or_else(|| EventError::UnknownRoomVersion(id.to_string()))
    }

    pub fn supports_join_rule(&self, join_rule: &str) -> bool {
        match join_rule {
            "public" | "invite" | "private" => true,
            "knock" => self.knocking,
            "restricted" => self.restricted_joins,
            "knock_restricted" => self.knock_restricted,
            _ => false,
        }
    }

    /// v11 rooms no longer carry `creator` in the create content.
    pub fn create_content_has_creator(&self) -> bool {
        !self.updated_redaction_rules
    }
}

pub fn supported_ids() -> Vec<&'static str> {
    SUPPORTED.iter().map(|version| version.id).collect()
}
