use ed25519_dalek::SigningKey;
use meshcheck_events::{
    content_hash, event_id_for, initial_room_events, Event, EventError, EventTemplate, Room,
    RoomVersion, ServerIdentity,
};
use serde_json::json;

fn identity() -> ServerIdentity {
    ServerIdentity::new("peer.test:8448", "ed25519:1", SigningKey::from_bytes(&[7u8; 32]))
}

fn seeded(identity: &ServerIdentity, version: &str) -> anyhow::Result<Room> {
    let parsed = RoomVersion::parse(version)?;
    let seed: Vec<EventTemplate> = initial_room_events(parsed, "@charlie:peer.test:8448")
        .into_iter()
        .map(|template| template.at(1_000))
        .collect();
    Ok(Room::create(identity, version, "!graph:peer.test:8448", &seed)?)
}

fn message(body: &str) -> EventTemplate {
    EventTemplate::new("m.room.message", "@charlie:peer.test:8448", json!({ "body": body })).at(2_000)
}

#[test]
fn build_and_sign_is_deterministic_for_every_version() -> anyhow::Result<()> {
    let id = identity();
    for version in meshcheck_events::version::supported_ids() {
        let first = seeded(&id, version)?;
        let second = seeded(&id, version)?;
        let a = id.sign_event(first.build_event(&id, &message("same"))?)?;
        let b = id.sign_event(second.build_event(&id, &message("same"))?)?;
        assert_eq!(a.event_id(), b.event_id(), "room version {version}");
        assert_eq!(event_id_for(a.version(), a.json()), a.event_id());
    }
    Ok(())
}

#[test]
fn depth_follows_deepest_parent() -> anyhow::Result<()> {
    let id = identity();
    let mut room = seeded(&id, "10")?;
    let b = room.create_and_add(&id, &message("b"))?;
    let c = room.create_and_add(&id, &message("c"))?;
    let d = id.sign_event(room.build_event_on(&id, &message("d"), vec![b.event_id().to_string()])?)?;
    room.add_fork_event(d.clone())?;

    let merge = room.build_event(&id, &message("merge"))?;
    assert_eq!(merge.prev_events().len(), 2);
    assert_eq!(merge.depth(), 1 + c.depth().max(d.depth()));
    assert_eq!(d.depth(), b.depth() + 1);
    Ok(())
}

#[test]
fn chain_then_fork_updates_extremities() -> anyhow::Result<()> {
    let id = identity();
    let mut room = seeded(&id, "10")?;
    let _a = room.create_and_add(&id, &message("a"))?;
    let b = room.create_and_add(&id, &message("b"))?;
    let c = room.create_and_add(&id, &message("c"))?;
    assert_eq!(room.forward_extremities(), vec![c.event_id().to_string()]);

    let d = id.sign_event(room.build_event_on(&id, &message("d"), vec![b.event_id().to_string()])?)?;
    assert!(matches!(
        room.add_event(d.clone()),
        Err(EventError::GraphViolation(_))
    ));
    room.add_fork_event(d.clone())?;

    let mut expected = vec![c.event_id().to_string(), d.event_id().to_string()];
    expected.sort();
    assert_eq!(room.forward_extremities(), expected);
    Ok(())
}

#[test]
fn signatures_and_hashes_verify() -> anyhow::Result<()> {
    let id = identity();
    let mut room = seeded(&id, "11")?;
    let event = room.create_and_add(&id, &message("signed"))?;
    event.verify_signature(id.server_name(), id.key_id(), &id.verifying_key())?;
    assert_eq!(event.json()["hashes"]["sha256"], content_hash(event.json()));

    let reparsed = Event::from_pdu(room.version(), event.json())?;
    assert_eq!(reparsed.event_id(), event.event_id());
    Ok(())
}

#[test]
fn raw_float_event_signs_but_fails_strict_parsing() -> anyhow::Result<()> {
    let id = identity();
    let room = seeded(&id, "6")?;
    let template = EventTemplate::new(
        "m.room.message",
        "@charlie:peer.test:8448",
        json!({ "body": "Message 1", "bad_val": 1.1 }),
    );
    assert!(room.build_event(&id, &template).is_err());

    let bad = id.sign_event(room.build_event(&id, &template.raw())?)?;
    bad.verify_signature(id.server_name(), id.key_id(), &id.verifying_key())?;
    let err = Event::from_pdu(room.version(), bad.json()).unwrap_err();
    assert!(err.to_string().contains("bad_val"), "{err}");
    Ok(())
}

#[test]
fn remote_join_seeds_state_with_single_extremity() -> anyhow::Result<()> {
    let remote = ServerIdentity::new("hs1", "ed25519:a", SigningKey::from_bytes(&[1u8; 32]));
    let source = seeded(&remote, "10")?;
    let join = remote.sign_event(
        source.build_event(&remote, &EventTemplate::member("@d:peer", "@d:peer", "join").at(5_000))?,
    )?;
    let state: Vec<Event> = source.current_state().into_iter().cloned().collect();
    let auth_chain = source.auth_chain(join.auth_events());

    let room = Room::from_remote_join(source.version(), source.room_id(), state, auth_chain, join.clone())?;
    assert_eq!(room.forward_extremities(), vec![join.event_id().to_string()]);
    assert_eq!(room.depth(), join.depth());
    assert!(room.state_event("m.room.create", "").is_some());

    let next = room.build_event(&remote, &message("after join"))?;
    assert_eq!(next.prev_events(), &[join.event_id().to_string()]);
    Ok(())
}
