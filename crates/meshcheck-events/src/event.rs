use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::canonical::{check_strict, to_canonical_bytes};
use crate::error::EventError;
use crate::identity::{insert_signature, signable_bytes, verify_json, ServerIdentity};
use crate::redaction::redact;
use crate::version::{EventIdFormat, RoomVersion};

/// What a test asks for; the room fills in graph and auth fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTemplate {
    pub event_type: String,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: Value,
    pub origin_server_ts: Option<i64>,
    raw: bool,
    overrides: Map<String, Value>,
}

impl EventTemplate {
    pub fn new(event_type: impl Into<String>, sender: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            sender: sender.into(),
            state_key: None,
            content,
            origin_server_ts: None,
            raw: false,
            overrides: Map::new(),
        }
    }

    pub fn state(
        event_type: impl Into<String>,
        sender: impl Into<String>,
        state_key: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            state_key: Some(state_key.into()),
            ..Self::new(event_type, sender, content)
        }
    }

    pub fn member(sender: impl Into<String>, target: impl Into<String>, membership: &str) -> Self {
        Self::state("m.room.member", sender, target, json!({ "membership": membership }))
    }

    pub fn at(mut self, origin_server_ts: i64) -> Self {
        self.origin_server_ts = Some(origin_server_ts);
        self
    }

    /// Skip shape validation so deliberately malformed events can be built
    /// and signed for negative tests.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Replace a top-level field of the built event before it is hashed and
    /// signed. Implies [`EventTemplate::raw`].
    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw = true;
        self.overrides.insert(key.into(), value);
        self
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub(crate) fn overrides(&self) -> &Map<String, Value> {
        &self.overrides
    }

    /// Shape checks applied on the normal build path.
    pub(crate) fn validate(&self, version: &RoomVersion) -> Result<(), EventError> {
        if self.raw {
            return Ok(());
        }
        if !self.content.is_object() {
            return Err(EventError::InvalidEvent(format!(
                "{} content must be an object",
                self.event_type
            )));
        }
        if version.strict_canonical_json {
            check_strict(&self.content).map_err(EventError::InvalidEvent)?;
        }
        if self.event_type == "m.room.member" {
            if self.state_key.is_none() {
                return Err(EventError::InvalidEvent("m.room.member requires a state_key".into()));
            }
            if !self.content.get("membership").is_some_and(Value::is_string) {
                return Err(EventError::InvalidEvent("m.room.member requires membership".into()));
            }
        }
        if self.event_type == "m.room.join_rules" {
            let rule = self.content.get("join_rule").and_then(Value::as_str).unwrap_or_default();
            if !version.supports_join_rule(rule) {
                return Err(EventError::InvalidEvent(format!(
                    "join rule '{rule}' not supported by room version {}",
                    version.id
                )));
            }
        }
        Ok(())
    }
}

/// The fields the graph reasons about. For raw events these hold the values
/// the room intended, even when the wire JSON was overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFields {
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub depth: i64,
    pub origin_server_ts: i64,
}

/// A fully shaped event that has not been hashed or signed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    version: &'static RoomVersion,
    fields: EventFields,
    proto: Map<String, Value>,
}

impl UnsignedEvent {
    pub(crate) fn new(version: &'static RoomVersion, fields: EventFields, proto: Map<String, Value>) -> Self {
        Self {
            version,
            fields,
            proto,
        }
    }

    /// Accept a proto event from a remote `make_join`/`make_knock` response.
    /// `origin` and `origin_server_ts` are restamped for the signing server.
    pub fn from_proto(
        version: &'static RoomVersion,
        proto: &Value,
        origin: &str,
        now_ms: i64,
    ) -> Result<Self, EventError> {
        let map = proto
            .as_object()
            .ok_or_else(|| EventError::InvalidEvent("proto event must be an object".into()))?;
        let mut proto = map.clone();
        proto.remove("signatures");
        proto.remove("hashes");
        proto.remove("event_id");
        if !version.updated_redaction_rules {
            proto.insert("origin".into(), Value::String(origin.to_string()));
        }
        proto.insert("origin_server_ts".into(), json!(now_ms));
        let fields = parse_fields(&proto)?;
        Ok(Self {
            version,
            fields,
            proto,
        })
    }

    pub fn version(&self) -> &'static RoomVersion {
        self.version
    }

    pub fn fields(&self) -> &EventFields {
        &self.fields
    }

    pub fn depth(&self) -> i64 {
        self.fields.depth
    }

    pub fn prev_events(&self) -> &[String] {
        &self.fields.prev_events
    }

    pub fn auth_events(&self) -> &[String] {
        &self.fields.auth_events
    }

    /// The proto event as served from `make_join`/`make_knock`.
    pub fn proto_json(&self) -> Value {
        Value::Object(self.proto.clone())
    }
}

/// A signed event. Immutable apart from extra signatures, which do not change
/// its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_id: String,
    version: &'static RoomVersion,
    fields: EventFields,
    json: Value,
}

impl Event {
    /// Parse and check an event received over federation. Required fields
    /// must be present with the right types and the content hash must match.
    pub fn from_pdu(version: &'static RoomVersion, pdu: &Value) -> Result<Self, EventError> {
        let map = pdu
            .as_object()
            .ok_or_else(|| EventError::InvalidEvent("pdu must be an object".into()))?;
        let fields = parse_fields(map)?;
        if !map.get("signatures").is_some_and(Value::is_object) {
            return Err(EventError::InvalidEvent("missing field 'signatures'".into()));
        }
        let claimed = map
            .get("hashes")
            .and_then(|hashes| hashes.get("sha256"))
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::InvalidEvent("missing field 'hashes.sha256'".into()))?;
        if version.strict_canonical_json {
            check_strict(pdu).map_err(EventError::InvalidEvent)?;
        }
        if claimed != content_hash(pdu) {
            return Err(EventError::InvalidEvent("content hash mismatch".into()));
        }
        Ok(Self {
            event_id: event_id_for(version, pdu),
            version,
            fields,
            json: pdu.clone(),
        })
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn version(&self) -> &'static RoomVersion {
        self.version
    }

    pub fn room_id(&self) -> &str {
        &self.fields.room_id
    }

    pub fn sender(&self) -> &str {
        &self.fields.sender
    }

    pub fn event_type(&self) -> &str {
        &self.fields.event_type
    }

    pub fn state_key(&self) -> Option<&str> {
        self.fields.state_key.as_deref()
    }

    pub fn is_state(&self) -> bool {
        self.fields.state_key.is_some()
    }

    pub fn content(&self) -> &Value {
        &self.fields.content
    }

    pub fn membership(&self) -> Option<&str> {
        if self.fields.event_type != "m.room.member" {
            return None;
        }
        self.fields.content.get("membership").and_then(Value::as_str)
    }

    pub fn prev_events(&self) -> &[String] {
        &self.fields.prev_events
    }

    pub fn auth_events(&self) -> &[String] {
        &self.fields.auth_events
    }

    pub fn depth(&self) -> i64 {
        self.fields.depth
    }

    pub fn origin_server_ts(&self) -> i64 {
        self.fields.origin_server_ts
    }

    /// The event exactly as sent over federation.
    pub fn json(&self) -> &Value {
        &self.json
    }

    pub fn into_json(self) -> Value {
        self.json
    }

    /// Client-style form with `event_id` included.
    pub fn json_with_id(&self) -> Value {
        let mut json = self.json.clone();
        if let Some(map) = json.as_object_mut() {
            map.insert("event_id".into(), Value::String(self.event_id.clone()));
        }
        json
    }

    /// Stripped state as carried in invite and knock responses.
    pub fn stripped(&self) -> Value {
        json!({
            "type": self.fields.event_type,
            "state_key": self.fields.state_key,
            "sender": self.fields.sender,
            "content": self.fields.content,
        })
    }

    /// Co-sign the event, as the invitee's server does for invites.
    pub fn add_signature(&mut self, identity: &ServerIdentity) -> Result<(), EventError> {
        let redacted = redact(self.version, &self.json);
        let signature = identity.sign_bytes(&signable_bytes(&redacted)?);
        insert_signature(&mut self.json, identity.server_name(), identity.key_id(), signature)
    }

    pub fn verify_signature(
        &self,
        server_name: &str,
        key_id: &str,
        key: &VerifyingKey,
    ) -> Result<(), EventError> {
        verify_json(&redact(self.version, &self.json), server_name, key_id, key)
    }
}

impl ServerIdentity {
    /// Hash, redact and sign an event, deriving its id from the reference
    /// hash.
    pub fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, EventError> {
        let UnsignedEvent {
            version,
            fields,
            proto,
        } = unsigned;
        let mut json = Value::Object(proto);
        let hash = content_hash(&json);
        if let Some(map) = json.as_object_mut() {
            map.insert("hashes".into(), json!({ "sha256": hash }));
        }
        let redacted = redact(version, &json);
        let signature = self.sign_bytes(&signable_bytes(&redacted)?);
        insert_signature(&mut json, self.server_name(), self.key_id(), signature)?;
        Ok(Event {
            event_id: event_id_for(version, &json),
            version,
            fields,
            json,
        })
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Base64 SHA-256 over the event minus `unsigned`, `signatures` and `hashes`.
pub fn content_hash(event: &Value) -> String {
    let mut stripped = event.as_object().cloned().unwrap_or_default();
    stripped.remove("unsigned");
    stripped.remove("signatures");
    stripped.remove("hashes");
    STANDARD_NO_PAD.encode(sha256(&to_canonical_bytes(&Value::Object(stripped))))
}

/// `$`-prefixed reference hash of the redacted event. Works on any JSON
/// object, including malformed PDUs, so callers can key rejections by id.
pub fn event_id_for(version: &RoomVersion, event: &Value) -> String {
    let mut redacted = redact(version, event).as_object().cloned().unwrap_or_default();
    redacted.remove("signatures");
    redacted.remove("unsigned");
    let digest = sha256(&to_canonical_bytes(&Value::Object(redacted)));
    let encoded = match version.event_id_format {
        EventIdFormat::Base64 => STANDARD_NO_PAD.encode(digest),
        EventIdFormat::UrlSafeBase64 => URL_SAFE_NO_PAD.encode(digest),
    };
    format!("${encoded}")
}

fn parse_fields(map: &Map<String, Value>) -> Result<EventFields, EventError> {
    fn string(map: &Map<String, Value>, key: &str) -> Result<String, EventError> {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EventError::InvalidEvent(format!("missing field '{key}'")))
    }
    fn integer(map: &Map<String, Value>, key: &str) -> Result<i64, EventError> {
        match map.get(key) {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| EventError::InvalidEvent(format!("field '{key}' must be an integer"))),
            None => Err(EventError::InvalidEvent(format!("missing field '{key}'"))),
        }
    }
    fn ids(map: &Map<String, Value>, key: &str) -> Result<Vec<String>, EventError> {
        let items = map
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| EventError::InvalidEvent(format!("missing field '{key}'")))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| EventError::InvalidEvent(format!("'{key}' must hold event ids")))
            })
            .collect()
    }

    let content = match map.get("content") {
        Some(content @ Value::Object(_)) => content.clone(),
        Some(_) => return Err(EventError::InvalidEvent("content must be an object".into())),
        None => return Err(EventError::InvalidEvent("missing field 'content'".into())),
    };
    let state_key = match map.get("state_key") {
        None => None,
        Some(Value::String(key)) => Some(key.clone()),
        Some(_) => return Err(EventError::InvalidEvent("state_key must be a string".into())),
    };
    Ok(EventFields {
        room_id: string(map, "room_id")?,
        sender: string(map, "sender")?,
        event_type: string(map, "type")?,
        state_key,
        content,
        prev_events: ids(map, "prev_events")?,
        auth_events: ids(map, "auth_events")?,
        depth: integer(map, "depth")?,
        origin_server_ts: integer(map, "origin_server_ts")?,
    })
}
