use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown room version: {0}")]
    UnknownRoomVersion(String),
    #[error("missing auth state: {0}")]
    MissingAuthState(String),
    #[error("graph violation: {0}")]
    GraphViolation(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}
