use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use meshcheck_events::{event_id_for, version, Event, Room, RoomVersion, ServerIdentity};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

pub type InviteCallback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type PduCallback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type EduCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Outcome per PDU of an inbound transaction, keyed by event id.
pub type TransactionOutcome = BTreeMap<String, Result<(), String>>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) on_invite: Option<InviteCallback>,
    pub(crate) on_pdu: Option<PduCallback>,
    pub(crate) on_edu: Option<EduCallback>,
}

/// A room held by the peer. Handlers and the test share it through the lock.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    version: &'static RoomVersion,
    room: Arc<Mutex<Room>>,
}

impl RoomHandle {
    pub(crate) fn new(room: Room) -> Self {
        Self {
            room_id: room.room_id().to_string(),
            version: room.version(),
            room: Arc::new(Mutex::new(room)),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> &'static RoomVersion {
        self.version
    }

    pub async fn lock(&self) -> MutexGuard<'_, Room> {
        self.room.lock().await
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("version", &self.version.id)
            .finish()
    }
}

/// State shared by every request task of one peer.
pub struct PeerState {
    identity: ServerIdentity,
    strict: bool,
    rooms: DashMap<String, RoomHandle>,
    aliases: DashMap<String, String>,
    invited_versions: DashMap<String, &'static RoomVersion>,
    unexpected: StdMutex<Vec<String>>,
    malformed_pdus: StdMutex<Vec<Value>>,
    pub(crate) callbacks: Callbacks,
}

impl PeerState {
    pub(crate) fn new(identity: ServerIdentity, strict: bool, callbacks: Callbacks) -> Self {
        Self {
            identity,
            strict,
            rooms: DashMap::new(),
            aliases: DashMap::new(),
            invited_versions: DashMap::new(),
            unexpected: StdMutex::new(Vec::new()),
            malformed_pdus: StdMutex::new(Vec::new()),
            callbacks,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn server_name(&self) -> &str {
        self.identity.server_name()
    }

    pub fn unexpected_requests_are_errors(&self) -> bool {
        self.strict
    }

    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    pub fn rooms(&self) -> Vec<RoomHandle> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn insert_room(&self, room: Room) -> RoomHandle {
        let handle = RoomHandle::new(room);
        self.rooms.insert(handle.room_id().to_string(), handle.clone());
        handle
    }

    pub(crate) fn insert_alias(&self, alias: String, room_id: String) {
        self.aliases.insert(alias, room_id);
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.aliases.get(alias).map(|entry| entry.value().clone())
    }

    pub(crate) fn remember_invite(&self, room_id: &str, version: &'static RoomVersion) {
        self.invited_versions.insert(room_id.to_string(), version);
    }

    /// Version of a room the peer was invited to but has not joined.
    pub fn invited_version(&self, room_id: &str) -> Option<&'static RoomVersion> {
        self.invited_versions.get(room_id).map(|entry| *entry.value())
    }

    pub(crate) fn record_unexpected(&self, request: String) {
        self.unexpected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
    }

    pub fn unexpected_requests(&self) -> Vec<String> {
        self.unexpected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Transaction entries that were not JSON objects and so have no event
    /// id to report under.
    pub fn malformed_pdus(&self) -> Vec<Value> {
        self.malformed_pdus
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Process the PDUs and EDUs of one inbound transaction. Every PDU is
    /// handled on its own: a bad PDU yields an error entry and never affects
    /// the others. Entries that are not objects are kept in
    /// [`PeerState::malformed_pdus`]. PDUs for rooms the peer does not hold
    /// are checked but not stored.
    pub async fn handle_transaction(&self, pdus: &[Value], edus: &[Value]) -> TransactionOutcome {
        let mut outcome = TransactionOutcome::new();
        for pdu in pdus {
            if !pdu.is_object() {
                tracing::error!(%pdu, "transaction: pdu is not an object");
                self.malformed_pdus
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(pdu.clone());
                continue;
            }
            let room_id = pdu.get("room_id").and_then(Value::as_str);
            let room = room_id.and_then(|id| self.room(id));
            let version = match (&room, room_id) {
                (Some(room), _) => room.version(),
                (None, Some(id)) => self.invited_version(id).unwrap_or(&version::DEFAULT),
                (None, None) => &version::DEFAULT,
            };
            let event_id = event_id_for(version, pdu);
            let result = self.accept_pdu(version, room.as_ref(), pdu).await;
            match &result {
                Ok(()) => tracing::debug!(%event_id, "transaction: accepted pdu"),
                Err(reason) => tracing::warn!(%event_id, %reason, "transaction: rejected pdu"),
            }
            outcome.insert(event_id, result);
        }

        for edu in edus {
            let edu_type = edu.get("edu_type").and_then(Value::as_str).unwrap_or("unknown");
            match &self.callbacks.on_edu {
                Some(callback) => callback(edu),
                None => tracing::debug!(edu_type, "transaction: ignoring edu"),
            }
        }
        outcome
    }

    async fn accept_pdu(
        &self,
        version: &'static RoomVersion,
        room: Option<&RoomHandle>,
        pdu: &Value,
    ) -> Result<(), String> {
        let event = Event::from_pdu(version, pdu).map_err(|e| e.to_string())?;
        if let Some(room) = room {
            let mut guard = room.lock().await;
            if !guard.contains(event.event_id()) {
                guard.add_event(event.clone()).map_err(|e| e.to_string())?;
            }
        }
        if let Some(callback) = &self.callbacks.on_pdu {
            callback(&event);
        }
        Ok(())
    }
}
