//! Named conditions over a single `/sync` response body.

use std::fmt;

use serde_json::Value;

type CheckFn = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// A named predicate evaluated against one sync response. `Err` carries the
/// reason it is not yet satisfied.
pub struct SyncCheck {
    name: String,
    check: CheckFn,
}

impl SyncCheck {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, response: &Value) -> Result<(), String> {
        (self.check)(response)
    }
}

impl fmt::Debug for SyncCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCheck").field("name", &self.name).finish()
    }
}

pub fn custom<F>(name: impl Into<String>, check: F) -> SyncCheck
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
{
    SyncCheck {
        name: name.into(),
        check: Box::new(check),
    }
}

fn room<'a>(response: &'a Value, section: &str, room_id: &str) -> Result<&'a Value, String> {
    response
        .get("rooms")
        .and_then(|rooms| rooms.get(section))
        .and_then(|rooms| rooms.get(room_id))
        .ok_or_else(|| format!("{room_id} not in rooms.{section}"))
}

fn events<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(|section| section.get("events"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn is_member(event: &Value, user_id: &str, memberships: &[&str]) -> bool {
    event.get("type").and_then(Value::as_str) == Some("m.room.member")
        && event.get("state_key").and_then(Value::as_str) == Some(user_id)
        && event
            .pointer("/content/membership")
            .and_then(Value::as_str)
            .is_some_and(|m| memberships.contains(&m))
}

fn any_event(
    events: &[Value],
    section: &str,
    check: impl Fn(&Value) -> bool,
) -> Result<(), String> {
    if events.iter().any(check) {
        Ok(())
    } else {
        Err(format!("no matching event among {} {section} event(s)", events.len()))
    }
}

/// `user_id` appears joined in the timeline or state of `room_id`.
pub fn joined_to(user_id: &str, room_id: &str) -> SyncCheck {
    let (user, room_id) = (user_id.to_string(), room_id.to_string());
    custom(format!("joined_to({user_id}, {room_id})"), move |response| {
        let joined = room(response, "join", &room_id)?;
        let mut all = events(joined, "timeline").to_vec();
        all.extend_from_slice(events(joined, "state"));
        any_event(&all, "join", |e| is_member(e, &user, &["join"]))
    })
}

pub fn invited_to(user_id: &str, room_id: &str) -> SyncCheck {
    let (user, room_id) = (user_id.to_string(), room_id.to_string());
    custom(format!("invited_to({user_id}, {room_id})"), move |response| {
        let invited = room(response, "invite", &room_id)?;
        any_event(events(invited, "invite_state"), "invite_state", |e| {
            is_member(e, &user, &["invite"])
        })
    })
}

/// `user_id` left or was banned from `room_id`.
pub fn left_from(user_id: &str, room_id: &str) -> SyncCheck {
    let (user, room_id) = (user_id.to_string(), room_id.to_string());
    custom(format!("left_from({user_id}, {room_id})"), move |response| {
        let left = room(response, "leave", &room_id)?;
        let mut all = events(left, "timeline").to_vec();
        all.extend_from_slice(events(left, "state"));
        any_event(&all, "leave", |e| is_member(e, &user, &["leave", "ban"]))
    })
}

pub fn timeline_has<F>(room_id: &str, check: F) -> SyncCheck
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let room_id = room_id.to_string();
    custom(format!("timeline_has({room_id})"), move |response| {
        let joined = room(response, "join", &room_id)?;
        any_event(events(joined, "timeline"), "timeline", &check)
    })
}

pub fn state_has<F>(room_id: &str, check: F) -> SyncCheck
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let room_id = room_id.to_string();
    custom(format!("state_has({room_id})"), move |response| {
        let joined = room(response, "join", &room_id)?;
        any_event(events(joined, "state"), "state", &check)
    })
}

pub fn ephemeral_has<F>(room_id: &str, check: F) -> SyncCheck
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let room_id = room_id.to_string();
    custom(format!("ephemeral_has({room_id})"), move |response| {
        let joined = room(response, "join", &room_id)?;
        any_event(events(joined, "ephemeral"), "ephemeral", &check)
    })
}

/// A presence event from `user_id`, optionally with the given `presence`
/// value, that passes every extra check.
pub fn presence_has(
    user_id: &str,
    presence: Option<&str>,
    checks: Vec<Box<dyn Fn(&Value) -> bool + Send + Sync>>,
) -> SyncCheck {
    let user = user_id.to_string();
    let presence = presence.map(str::to_string);
    let name = match &presence {
        Some(p) => format!("presence_has({user_id}, {p})"),
        None => format!("presence_has({user_id})"),
    };
    custom(name, move |response| {
        any_event(events(response, "presence"), "presence", |e| {
            e.get("sender").and_then(Value::as_str) == Some(user.as_str())
                && presence
                    .as_deref()
                    .is_none_or(|p| e.pointer("/content/presence").and_then(Value::as_str) == Some(p))
                && checks.iter().all(|check| check(e))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(user: &str, membership: &str) -> Value {
        json!({
            "type": "m.room.member",
            "state_key": user,
            "sender": user,
            "content": { "membership": membership },
        })
    }

    #[test]
    fn joined_to_looks_at_timeline_and_state() {
        let check = joined_to("@a:hs1", "!r:hs1");
        let in_state = json!({ "rooms": { "join": { "!r:hs1": {
            "state": { "events": [member("@a:hs1", "join")] },
            "timeline": { "events": [] },
        }}}});
        assert_eq!(check.evaluate(&in_state), Ok(()));

        let missing = json!({ "rooms": { "join": {} } });
        assert_eq!(check.evaluate(&missing), Err("!r:hs1 not in rooms.join".to_string()));
        assert_eq!(check.name(), "joined_to(@a:hs1, !r:hs1)");
    }

    #[test]
    fn invited_and_left_use_their_sections() {
        let response = json!({ "rooms": {
            "invite": { "!i:hs1": { "invite_state": { "events": [member("@a:hs1", "invite")] } } },
            "leave": { "!l:hs1": { "timeline": { "events": [member("@a:hs1", "ban")] } } },
        }});
        assert!(invited_to("@a:hs1", "!i:hs1").evaluate(&response).is_ok());
        assert!(left_from("@a:hs1", "!l:hs1").evaluate(&response).is_ok());
        assert!(invited_to("@b:hs1", "!i:hs1").evaluate(&response).is_err());
    }

    #[test]
    fn presence_filters_by_value_and_checks() {
        let response = json!({ "presence": { "events": [{
            "type": "m.presence",
            "sender": "@a:hs1",
            "content": { "presence": "online", "status_msg": "hi" },
        }]}});
        assert!(presence_has("@a:hs1", Some("online"), vec![]).evaluate(&response).is_ok());
        assert!(presence_has("@a:hs1", Some("offline"), vec![]).evaluate(&response).is_err());
        let status = presence_has(
            "@a:hs1",
            None,
            vec![Box::new(|e: &Value| e.pointer("/content/status_msg") == Some(&json!("hi")))],
        );
        assert!(status.evaluate(&response).is_ok());
    }
}
