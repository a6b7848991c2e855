pub mod check;
pub mod client;
pub mod engine;
pub mod error;
pub mod waiter;

pub use check::{
    custom, ephemeral_has, invited_to, joined_to, left_from, presence_has, state_has,
    timeline_has, SyncCheck,
};
pub use client::{CsApiClient, SyncRequest};
pub use engine::PollingSyncEngine;
pub use error::{SyncError, Unmet, WaitError};
pub use waiter::Waiter;
