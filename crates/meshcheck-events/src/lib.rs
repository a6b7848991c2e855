//! Building, signing and tracking the events of emulated rooms.

pub mod auth;
pub mod canonical;
pub mod error;
pub mod event;
pub mod identity;
pub mod redaction;
pub mod room;
pub mod version;

pub use error::EventError;
pub use event::{content_hash, event_id_for, Event, EventFields, EventTemplate, UnsignedEvent};
pub use identity::{decode_verifying_key, verify_json, ServerIdentity};
pub use room::{initial_room_events, Room};
pub use version::RoomVersion;
