use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::{json, Map, Value};

use crate::auth::{self, StateKey};
use crate::error::EventError;
use crate::event::{Event, EventFields, EventTemplate, UnsignedEvent};
use crate::identity::ServerIdentity;
use crate::version::RoomVersion;

/// State types copied into `invite_room_state` / `knock_room_state`.
const STRIPPED_STATE_TYPES: &[&str] = &[
    "m.room.create",
    "m.room.join_rules",
    "m.room.canonical_alias",
    "m.room.name",
    "m.room.avatar",
    "m.room.encryption",
];

/// The standard seed for a room created by `creator`: create event, the
/// creator's join, power levels with the creator at 100 and a public join
/// rule.
pub fn initial_room_events(version: &RoomVersion, creator: &str) -> Vec<EventTemplate> {
    let mut create = json!({ "room_version": version.id });
    if version.create_content_has_creator() {
        create["creator"] = json!(creator);
    }
    vec![
        EventTemplate::state("m.room.create", creator, "", create),
        EventTemplate::member(creator, creator, "join"),
        EventTemplate::state(
            "m.room.power_levels",
            creator,
            "",
            json!({
                "users": { creator: 100 },
                "users_default": 0,
                "events_default": 0,
                "state_default": 50,
                "ban": 50,
                "kick": 50,
                "redact": 50,
                "invite": 0,
            }),
        ),
        EventTemplate::state("m.room.join_rules", creator, "", json!({ "join_rule": "public" })),
    ]
}

/// In-memory DAG of one room as seen by the emulated server.
#[derive(Debug, Clone)]
pub struct Room {
    room_id: String,
    version: &'static RoomVersion,
    events: HashMap<String, Event>,
    timeline: Vec<String>,
    forward_extremities: BTreeSet<String>,
    state: BTreeMap<StateKey, String>,
    depth: i64,
}

impl Room {
    pub fn new(room_id: impl Into<String>, version: &'static RoomVersion) -> Self {
        Self {
            room_id: room_id.into(),
            version,
            events: HashMap::new(),
            timeline: Vec::new(),
            forward_extremities: BTreeSet::new(),
            state: BTreeMap::new(),
            depth: 0,
        }
    }

    /// Create a room under `version_id` and append `templates` in order.
    pub fn create(
        identity: &ServerIdentity,
        version_id: &str,
        room_id: impl Into<String>,
        templates: &[EventTemplate],
    ) -> Result<Self, EventError> {
        let version = RoomVersion::parse(version_id)?;
        let mut room = Self::new(room_id, version);
        for template in templates {
            room.create_and_add(identity, template)?;
        }
        tracing::debug!(
            room_id = %room.room_id,
            version = version.id,
            events = room.timeline.len(),
            "created room"
        );
        Ok(room)
    }

    /// Rebuild a room joined on a remote server from its `send_join`
    /// response. The join event becomes the only forward extremity.
    pub fn from_remote_join(
        version: &'static RoomVersion,
        room_id: impl Into<String>,
        state: Vec<Event>,
        auth_chain: Vec<Event>,
        join: Event,
    ) -> Result<Self, EventError> {
        let mut room = Self::new(room_id, version);
        if join.room_id() != room.room_id {
            return Err(EventError::GraphViolation(format!(
                "join event {} belongs to {}, not {}",
                join.event_id(),
                join.room_id(),
                room.room_id
            )));
        }
        let state_ids: HashSet<String> = state.iter().map(|ev| ev.event_id().to_string()).collect();
        let mut seeded: Vec<Event> = auth_chain
            .into_iter()
            .filter(|ev| !state_ids.contains(ev.event_id()))
            .chain(state.iter().cloned())
            .collect();
        seeded.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.event_id().cmp(b.event_id()))
        });
        for event in seeded {
            room.index(event);
        }
        for event in &state {
            if let Some(key) = event.state_key() {
                room.state
                    .insert((event.event_type().to_string(), key.to_string()), event.event_id().to_string());
            }
        }
        if room.state_event(auth::CREATE, "").is_none() {
            return Err(EventError::MissingAuthState(format!(
                "send_join state for {} has no m.room.create event",
                room.room_id
            )));
        }
        let join_id = join.event_id().to_string();
        if let Some(key) = join.state_key() {
            room.state
                .insert((join.event_type().to_string(), key.to_string()), join_id.clone());
        }
        room.record(join);
        room.forward_extremities = BTreeSet::from([join_id]);
        Ok(room)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> &'static RoomVersion {
        self.version
    }

    /// Highest depth appended so far.
    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn event(&self, event_id: &str) -> Option<&Event> {
        self.events.get(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn timeline(&self) -> impl Iterator<Item = &Event> {
        self.timeline.iter().filter_map(|id| self.events.get(id))
    }

    pub fn latest_event(&self) -> Option<&Event> {
        self.timeline.last().and_then(|id| self.events.get(id))
    }

    pub fn forward_extremities(&self) -> Vec<String> {
        self.forward_extremities.iter().cloned().collect()
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.state
            .get(&(event_type.to_string(), state_key.to_string()))
            .and_then(|id| self.events.get(id))
    }

    pub fn current_state(&self) -> Vec<&Event> {
        self.state.values().filter_map(|id| self.events.get(id)).collect()
    }

    /// Membership of `user_id` in current state.
    pub fn membership(&self, user_id: &str) -> Option<&str> {
        self.state_event(auth::MEMBER, user_id).and_then(Event::membership)
    }

    pub fn stripped_state(&self) -> Vec<Value> {
        STRIPPED_STATE_TYPES
            .iter()
            .filter_map(|event_type| self.state_event(event_type, ""))
            .map(Event::stripped)
            .collect()
    }

    /// Shape an event on top of the current forward extremities.
    pub fn build_event(
        &self,
        identity: &ServerIdentity,
        template: &EventTemplate,
    ) -> Result<UnsignedEvent, EventError> {
        let prev_events = self.forward_extremities();
        self.build_event_on(identity, template, prev_events)
    }

    /// Shape an event whose parents are chosen by the caller, for building
    /// forks. Every parent must already be in the room.
    pub fn build_event_on(
        &self,
        identity: &ServerIdentity,
        template: &EventTemplate,
        prev_events: Vec<String>,
    ) -> Result<UnsignedEvent, EventError> {
        template.validate(self.version)?;

        let is_create = template.event_type == auth::CREATE;
        if is_create && !self.is_empty() {
            return Err(EventError::GraphViolation(format!(
                "{} already has a create event",
                self.room_id
            )));
        }
        if !is_create && self.state_event(auth::CREATE, "").is_none() {
            return Err(EventError::MissingAuthState(format!(
                "{} has no m.room.create event",
                self.room_id
            )));
        }

        let mut depth = 0;
        for prev in &prev_events {
            let parent = self.events.get(prev).ok_or_else(|| {
                EventError::GraphViolation(format!("prev event {prev} is not in {}", self.room_id))
            })?;
            depth = depth.max(parent.depth());
        }
        let depth = depth + 1;

        let auth_events: Vec<String> = auth::auth_state_needed(
            self.version,
            &template.event_type,
            &template.sender,
            template.state_key.as_deref(),
            &template.content,
        )
        .into_iter()
        .filter_map(|key| self.state.get(&key).cloned())
        .collect();

        let origin_server_ts = template
            .origin_server_ts
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let mut proto = Map::new();
        proto.insert("room_id".into(), json!(self.room_id));
        proto.insert("sender".into(), json!(template.sender));
        proto.insert("type".into(), json!(template.event_type));
        if let Some(state_key) = &template.state_key {
            proto.insert("state_key".into(), json!(state_key));
        }
        proto.insert("content".into(), template.content.clone());
        proto.insert("prev_events".into(), json!(prev_events));
        proto.insert("auth_events".into(), json!(auth_events));
        proto.insert("depth".into(), json!(depth));
        proto.insert("origin_server_ts".into(), json!(origin_server_ts));
        if !self.version.updated_redaction_rules {
            proto.insert("origin".into(), json!(identity.server_name()));
        }
        // A null override drops the key entirely.
        for (key, value) in template.overrides() {
            if value.is_null() {
                proto.remove(key);
            } else {
                proto.insert(key.clone(), value.clone());
            }
        }

        let fields = EventFields {
            room_id: self.room_id.clone(),
            sender: template.sender.clone(),
            event_type: template.event_type.clone(),
            state_key: template.state_key.clone(),
            content: template.content.clone(),
            prev_events,
            auth_events,
            depth,
            origin_server_ts,
        };
        Ok(UnsignedEvent::new(self.version, fields, proto))
    }

    /// Append an event built on the current forward extremities. Nothing is
    /// changed when the event is rejected.
    pub fn add_event(&mut self, event: Event) -> Result<(), EventError> {
        self.check_new(&event)?;
        if let Some(stale) = event
            .prev_events()
            .iter()
            .find(|prev| !self.forward_extremities.contains(*prev))
        {
            return Err(EventError::GraphViolation(format!(
                "prev event {stale} of {} is not a forward extremity of {}",
                event.event_id(),
                self.room_id
            )));
        }
        self.check_depth(&event)?;
        self.append(event);
        Ok(())
    }

    /// Append an event whose parents are known but need not be forward
    /// extremities, creating a fork in the DAG.
    pub fn add_fork_event(&mut self, event: Event) -> Result<(), EventError> {
        self.check_new(&event)?;
        if let Some(unknown) = event.prev_events().iter().find(|prev| !self.contains(prev)) {
            return Err(EventError::GraphViolation(format!(
                "prev event {unknown} of {} is not in {}",
                event.event_id(),
                self.room_id
            )));
        }
        self.check_depth(&event)?;
        self.append(event);
        Ok(())
    }

    /// Build, sign and append in one step.
    pub fn create_and_add(
        &mut self,
        identity: &ServerIdentity,
        template: &EventTemplate,
    ) -> Result<Event, EventError> {
        let unsigned = self.build_event(identity, template)?;
        let event = identity.sign_event(unsigned)?;
        self.add_event(event.clone())?;
        Ok(event)
    }

    /// Transitive closure of `auth_events` starting from `event_ids`,
    /// ordered by depth. Ids the room does not hold are skipped.
    pub fn auth_chain<S: AsRef<str>>(&self, event_ids: &[S]) -> Vec<Event> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = event_ids.iter().map(|id| id.as_ref()).collect();
        let mut chain = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(event) = self.events.get(id) else {
                continue;
            };
            chain.push(event.clone());
            queue.extend(event.auth_events().iter().map(String::as_str));
        }
        sort_topologically(&mut chain);
        chain
    }

    /// Events reachable backwards from `latest` that are not at or behind
    /// `earliest`, as served by `get_missing_events`. At most `limit` events
    /// with depth of at least `min_depth` are returned, oldest first.
    pub fn events_between<S: AsRef<str>>(
        &self,
        earliest: &[S],
        latest: &[S],
        limit: usize,
        min_depth: i64,
    ) -> Vec<Event> {
        let stop: HashSet<&str> = earliest.iter().map(|id| id.as_ref()).collect();
        let mut seen: HashSet<&str> = latest.iter().map(|id| id.as_ref()).collect();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for id in latest {
            if let Some(event) = self.events.get(id.as_ref()) {
                queue.extend(event.prev_events().iter().map(String::as_str));
            }
        }

        let mut found = Vec::new();
        while let Some(id) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            if stop.contains(id) || !seen.insert(id) {
                continue;
            }
            let Some(event) = self.events.get(id) else {
                continue;
            };
            if event.depth() < min_depth {
                continue;
            }
            found.push(event.clone());
            queue.extend(event.prev_events().iter().map(String::as_str));
        }
        sort_topologically(&mut found);
        found
    }

    fn check_new(&self, event: &Event) -> Result<(), EventError> {
        if event.room_id() != self.room_id {
            return Err(EventError::GraphViolation(format!(
                "event {} belongs to {}, not {}",
                event.event_id(),
                event.room_id(),
                self.room_id
            )));
        }
        if self.contains(event.event_id()) {
            return Err(EventError::GraphViolation(format!(
                "event {} already in {}",
                event.event_id(),
                self.room_id
            )));
        }
        if event.prev_events().is_empty() && !self.is_empty() {
            return Err(EventError::GraphViolation(format!(
                "event {} has no prev_events but {} is not empty",
                event.event_id(),
                self.room_id
            )));
        }
        Ok(())
    }

    fn append(&mut self, event: Event) {
        for prev in event.prev_events() {
            self.forward_extremities.remove(prev);
        }
        self.forward_extremities.insert(event.event_id().to_string());
        if let Some(state_key) = event.state_key() {
            self.state.insert(
                (event.event_type().to_string(), state_key.to_string()),
                event.event_id().to_string(),
            );
        }
        self.record(event);
    }

    /// Depth must be one more than the deepest parent, and 1 for the create
    /// event. Call only once every parent is known.
    fn check_depth(&self, event: &Event) -> Result<(), EventError> {
        let deepest = event
            .prev_events()
            .iter()
            .filter_map(|prev| self.event(prev))
            .map(Event::depth)
            .max()
            .unwrap_or(0);
        if event.depth() != deepest + 1 {
            return Err(EventError::GraphViolation(format!(
                "event {} has depth {}, expected {}",
                event.event_id(),
                event.depth(),
                deepest + 1
            )));
        }
        Ok(())
    }

    fn record(&mut self, event: Event) {
        self.depth = self.depth.max(event.depth());
        self.timeline.push(event.event_id().to_string());
        self.events.insert(event.event_id().to_string(), event);
    }

    fn index(&mut self, event: Event) {
        if !self.contains(event.event_id()) {
            self.record(event);
        }
    }
}

fn sort_topologically(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.event_id().cmp(b.event_id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{V10, V11};
    use ed25519_dalek::SigningKey;

    fn identity() -> ServerIdentity {
        ServerIdentity::new("peer", "ed25519:1", SigningKey::from_bytes(&[9u8; 32]))
    }

    fn seeded(version: &str) -> Room {
        let id = identity();
        let parsed = RoomVersion::parse(version).expect("version");
        Room::create(&id, version, "!room:peer", &initial_room_events(parsed, "@c:peer"))
            .expect("create room")
    }

    fn message(body: &str) -> EventTemplate {
        EventTemplate::new("m.room.message", "@c:peer", json!({ "body": body }))
    }

    #[test]
    fn seed_produces_linear_chain() {
        let room = seeded("10");
        let depths: Vec<i64> = room.timeline().map(Event::depth).collect();
        assert_eq!(depths, vec![1, 2, 3, 4]);
        assert_eq!(room.forward_extremities().len(), 1);
        assert_eq!(room.membership("@c:peer"), Some("join"));
        let create = room.state_event("m.room.create", "").expect("create");
        assert!(create.auth_events().is_empty());
        assert!(create.prev_events().is_empty());
    }

    #[test]
    fn v11_create_has_no_creator_or_origin() {
        let room = seeded("11");
        let create = room.state_event("m.room.create", "").expect("create");
        assert!(create.content().get("creator").is_none());
        assert!(create.json().get("origin").is_none());
        assert_eq!(room.version(), &V11);
    }

    #[test]
    fn unknown_version_fails_create() {
        let err = Room::create(&identity(), "2", "!r:peer", &[]).unwrap_err();
        assert!(matches!(err, EventError::UnknownRoomVersion(v) if v == "2"));
    }

    #[test]
    fn building_without_create_is_missing_auth_state() {
        let room = Room::new("!r:peer", &V10);
        let err = room.build_event(&identity(), &message("hi")).unwrap_err();
        assert!(matches!(err, EventError::MissingAuthState(_)));
    }

    #[test]
    fn join_cites_create_power_levels_and_join_rules() {
        let room = seeded("10");
        let unsigned = room
            .build_event(&identity(), &EventTemplate::member("@d:peer", "@d:peer", "join"))
            .expect("build");
        let expect: Vec<String> = [("m.room.create", ""), ("m.room.power_levels", ""), ("m.room.join_rules", "")]
            .iter()
            .map(|(t, k)| room.state_event(t, k).expect("state").event_id().to_string())
            .collect();
        assert_eq!(unsigned.auth_events(), expect.as_slice());
    }

    #[test]
    fn stale_parent_is_rejected_without_mutation() {
        let id = identity();
        let mut room = seeded("10");
        let first = id.sign_event(room.build_event(&id, &message("a")).expect("build")).expect("sign");
        let second = id.sign_event(room.build_event(&id, &message("b")).expect("build")).expect("sign");
        room.add_event(first).expect("first appends");
        let before = room.forward_extremities();
        let err = room.add_event(second.clone()).unwrap_err();
        assert!(matches!(err, EventError::GraphViolation(_)));
        assert_eq!(room.forward_extremities(), before);
        assert!(!room.contains(second.event_id()));
    }

    #[test]
    fn duplicate_event_is_rejected() {
        let id = identity();
        let mut room = seeded("10");
        let event = room.create_and_add(&id, &message("a")).expect("add");
        let err = room.add_fork_event(event).unwrap_err();
        assert!(err.to_string().contains("already in"));
    }

    #[test]
    fn invalid_content_rejected_on_normal_path() {
        let room = seeded("10");
        let bad = EventTemplate::new("m.room.message", "@c:peer", json!({ "bad_val": 1.1 }));
        assert!(matches!(
            room.build_event(&identity(), &bad),
            Err(EventError::InvalidEvent(_))
        ));
        assert!(room.build_event(&identity(), &bad.raw()).is_ok());
    }

    #[test]
    fn overrides_change_the_wire_json_only() {
        let id = identity();
        let room = seeded("10");
        let template = message("a")
            .with_override("depth", json!("not a number"))
            .with_override("origin", Value::Null);
        let event = id.sign_event(room.build_event(&id, &template).expect("build")).expect("sign");
        assert_eq!(event.json()["depth"], "not a number");
        assert!(event.json().get("origin").is_none());
        assert_eq!(event.depth(), room.depth() + 1);
    }

    #[test]
    fn wrong_depth_is_rejected_on_both_append_paths() {
        let id = identity();
        let mut room = seeded("10");
        let skipped = message("a").with_override("depth", json!(room.depth() + 5));
        let signed = id.sign_event(room.build_event(&id, &skipped).expect("build")).expect("sign");
        let inbound = Event::from_pdu(&V10, signed.json()).expect("parse");
        assert_eq!(inbound.depth(), room.depth() + 5);

        let before = room.forward_extremities();
        let err = room.add_fork_event(inbound.clone()).unwrap_err();
        assert!(matches!(err, EventError::GraphViolation(ref m) if m.contains("depth")), "{err}");
        let err = room.add_event(inbound).unwrap_err();
        assert!(matches!(err, EventError::GraphViolation(ref m) if m.contains("depth")), "{err}");
        assert_eq!(room.forward_extremities(), before);
    }

    #[test]
    fn auth_chain_walks_back_to_create() {
        let id = identity();
        let mut room = seeded("10");
        let event = room.create_and_add(&id, &message("a")).expect("add");
        let chain = room.auth_chain(event.auth_events());
        assert_eq!(chain.first().map(Event::event_type), Some("m.room.create"));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn events_between_stops_at_earliest() {
        let id = identity();
        let mut room = seeded("10");
        let a = room.create_and_add(&id, &message("a")).expect("a");
        let b = room.create_and_add(&id, &message("b")).expect("b");
        let c = room.create_and_add(&id, &message("c")).expect("c");
        let missing = room.events_between(
            &[a.event_id().to_string()],
            &[c.event_id().to_string()],
            10,
            0,
        );
        let ids: Vec<&str> = missing.iter().map(Event::event_id).collect();
        assert_eq!(ids, vec![b.event_id()]);

        let limited = room.events_between(&[] as &[String], &[c.event_id().to_string()], 2, 0);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn stripped_state_carries_create_and_join_rules() {
        let room = seeded("10");
        let stripped = room.stripped_state();
        let types: Vec<&str> = stripped.iter().filter_map(|ev| ev["type"].as_str()).collect();
        assert_eq!(types, vec!["m.room.create", "m.room.join_rules"]);
    }
}
