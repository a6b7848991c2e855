//! Which pieces of current state an event must cite in `auth_events`.

use serde_json::Value;

use crate::version::RoomVersion;

pub const CREATE: &str = "m.room.create";
pub const MEMBER: &str = "m.room.member";
pub const POWER_LEVELS: &str = "m.room.power_levels";
pub const JOIN_RULES: &str = "m.room.join_rules";
pub const THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";

/// A `(type, state_key)` pair in room state.
pub type StateKey = (String, String);

/// State entries that authorise an event of `event_type` sent by `sender`.
/// Entries are ordered and unique; the create event needs none.
pub fn auth_state_needed(
    version: &RoomVersion,
    event_type: &str,
    sender: &str,
    state_key: Option<&str>,
    content: &Value,
) -> Vec<StateKey> {
    if event_type == CREATE {
        return Vec::new();
    }

    let mut needed: Vec<StateKey> = vec![
        (CREATE.into(), String::new()),
        (POWER_LEVELS.into(), String::new()),
        (MEMBER.into(), sender.to_string()),
    ];

    if event_type == MEMBER {
        if let Some(target) = state_key {
            needed.push((MEMBER.into(), target.to_string()));
        }
        let membership = content.get("membership").and_then(Value::as_str).unwrap_or_default();
        let needs_join_rules = match membership {
            "join" | "invite" => true,
            "knock" => version.knocking,
            _ => false,
        };
        if needs_join_rules {
            needed.push((JOIN_RULES.into(), String::new()));
        }
        if membership == "invite" {
            if let Some(token) = content
                .pointer("/third_party_invite/signed/token")
                .and_then(Value::as_str)
            {
                needed.push((THIRD_PARTY_INVITE.into(), token.to_string()));
            }
        }
        if membership == "join" && version.restricted_joins {
            if let Some(via) = content
                .get("join_authorised_via_users_server")
                .and_then(Value::as_str)
            {
                needed.push((MEMBER.into(), via.to_string()));
            }
        }
    }

    let mut unique: Vec<StateKey> = Vec::with_capacity(needed.len());
    for entry in needed {
        if !unique.contains(&entry) {
            unique.push(entry);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{V10, V6};
    use serde_json::json;

    fn key(t: &str, s: &str) -> StateKey {
        (t.to_string(), s.to_string())
    }

    #[test]
    fn create_needs_nothing() {
        assert!(auth_state_needed(&V10, CREATE, "@a:hs1", Some(""), &json!({})).is_empty());
    }

    #[test]
    fn message_needs_create_power_levels_and_sender() {
        let needed = auth_state_needed(&V10, "m.room.message", "@a:hs1", None, &json!({}));
        assert_eq!(
            needed,
            vec![key(CREATE, ""), key(POWER_LEVELS, ""), key(MEMBER, "@a:hs1")]
        );
    }

    #[test]
    fn self_join_deduplicates_member_entry() {
        let needed = auth_state_needed(
            &V10,
            MEMBER,
            "@a:hs1",
            Some("@a:hs1"),
            &json!({"membership": "join"}),
        );
        assert_eq!(
            needed,
            vec![
                key(CREATE, ""),
                key(POWER_LEVELS, ""),
                key(MEMBER, "@a:hs1"),
                key(JOIN_RULES, ""),
            ]
        );
    }

    #[test]
    fn restricted_join_cites_authorising_user() {
        let content = json!({"membership": "join", "join_authorised_via_users_server": "@b:hs2"});
        let needed = auth_state_needed(&V10, MEMBER, "@a:hs1", Some("@a:hs1"), &content);
        assert!(needed.contains(&key(MEMBER, "@b:hs2")));
        let legacy = auth_state_needed(&V6, MEMBER, "@a:hs1", Some("@a:hs1"), &content);
        assert!(!legacy.contains(&key(MEMBER, "@b:hs2")));
    }

    #[test]
    fn knock_only_needs_join_rules_when_supported() {
        let content = json!({"membership": "knock"});
        assert!(auth_state_needed(&V10, MEMBER, "@a:hs1", Some("@a:hs1"), &content)
            .contains(&key(JOIN_RULES, "")));
        assert!(!auth_state_needed(&V6, MEMBER, "@a:hs1", Some("@a:hs1"), &content)
            .contains(&key(JOIN_RULES, "")));
    }

    #[test]
    fn third_party_invite_cites_token() {
        let content = json!({
            "membership": "invite",
            "third_party_invite": {"signed": {"token": "abc"}},
        });
        let needed = auth_state_needed(&V10, MEMBER, "@a:hs1", Some("@c:hs2"), &content);
        assert!(needed.contains(&key(THIRD_PARTY_INVITE, "abc")));
        assert!(needed.contains(&key(MEMBER, "@c:hs2")));
    }
}
