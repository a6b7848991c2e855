//! An emulated Matrix homeserver that the server under test federates with.
//!
//! A [`FederationPeer`] is assembled from handler bundles on a
//! [`PeerBuilder`], bound, and started with [`FederationPeer::listen`]. The
//! returned [`ListenGuard`] stops the server when dropped.

pub mod client;
pub mod error;
pub mod handlers;
pub mod peer;
pub mod state;
mod tls;

pub use axum::routing::MethodFilter;
pub use client::{FederationClient, MakeMembershipResponse, SendJoinResponse};
pub use error::{FederationError, PeerError};
pub use peer::{FederationPeer, ListenGuard, PeerBuilder};
pub use state::{PeerState, RoomHandle, TransactionOutcome};
