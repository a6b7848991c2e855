use serde_json::{Map, Value};

use crate::version::RoomVersion;

const KEPT_TOP_LEVEL: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "content",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "auth_events",
    "origin_server_ts",
];

/// Dropped from the kept set by the v11 rules.
const LEGACY_TOP_LEVEL: &[&str] = &["origin", "membership", "prev_state"];

/// Strip an event down to the fields covered by its reference hash and
/// signatures.
pub fn redact(version: &RoomVersion, event: &Value) -> Value {
    let Some(map) = event.as_object() else {
        return event.clone();
    };
    let event_type = map.get("type").and_then(Value::as_str).unwrap_or_default();

    let mut out = Map::new();
    for (key, value) in map {
        let keep = KEPT_TOP_LEVEL.contains(&key.as_str())
            || (!version.updated_redaction_rules && LEGACY_TOP_LEVEL.contains(&key.as_str()));
        if keep && key != "content" {
            out.insert(key.clone(), value.clone());
        }
    }

    let content = map
        .get("content")
        .and_then(Value::as_object)
        .map(|content| redact_content(version, event_type, content))
        .unwrap_or_default();
    out.insert("content".into(), Value::Object(content));
    Value::Object(out)
}

fn redact_content(version: &RoomVersion, event_type: &str, content: &Map<String, Value>) -> Map<String, Value> {
    if event_type == "m.room.create" && version.updated_redaction_rules {
        return content.clone();
    }

    let mut kept: Vec<&str> = match event_type {
        "m.room.member" => vec!["membership"],
        "m.room.create" => vec!["creator"],
        "m.room.join_rules" => vec!["join_rule"],
        "m.room.power_levels" => vec![
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.aliases" if version.redaction_keeps_aliases => vec!["aliases"],
        "m.room.history_visibility" => vec!["history_visibility"],
        "m.room.redaction" if version.updated_redaction_rules => vec!["redacts"],
        _ => Vec::new(),
    };
    if event_type == "m.room.join_rules" && version.restricted_joins {
        kept.push("allow");
    }
    if event_type == "m.room.member" && version.redaction_keeps_authorising_user {
        kept.push("join_authorised_via_users_server");
    }
    if event_type == "m.room.power_levels" && version.updated_redaction_rules {
        kept.push("invite");
    }

    let mut out = Map::new();
    for key in kept {
        if let Some(value) = content.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if event_type == "m.room.member" && version.updated_redaction_rules {
        if let Some(signed) = content.get("third_party_invite").and_then(|tpi| tpi.get("signed")) {
            let mut tpi = Map::new();
            tpi.insert("signed".into(), signed.clone());
            out.insert("third_party_invite".into(), Value::Object(tpi));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{V10, V11, V5, V8};
    use serde_json::json;

    #[test]
    fn message_content_is_emptied() {
        let event = json!({
            "type": "m.room.message",
            "content": {"body": "hi"},
            "unsigned": {"age": 4},
            "origin": "hs1",
        });
        let redacted = redact(&V10, &event);
        assert_eq!(redacted["content"], json!({}));
        assert!(redacted.get("unsigned").is_none());
        assert_eq!(redacted["origin"], "hs1");
    }

    #[test]
    fn v11_keeps_whole_create_content_and_drops_origin() {
        let event = json!({
            "type": "m.room.create",
            "origin": "hs1",
            "content": {"creator": "@a:hs1", "room_version": "11", "m.federate": true},
        });
        let redacted = redact(&V11, &event);
        assert_eq!(redacted["content"]["m.federate"], true);
        assert!(redacted.get("origin").is_none());
        assert_eq!(redact(&V10, &event)["content"], json!({"creator": "@a:hs1"}));
    }

    #[test]
    fn allow_list_survives_from_v8() {
        let event = json!({
            "type": "m.room.join_rules",
            "content": {"join_rule": "restricted", "allow": [], "extra": 1},
        });
        assert_eq!(
            redact(&V8, &event)["content"],
            json!({"join_rule": "restricted", "allow": []})
        );
        assert_eq!(redact(&V5, &event)["content"], json!({"join_rule": "restricted"}));
    }
}
