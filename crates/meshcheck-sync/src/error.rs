use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {}ms waiting for {name}", .after.as_millis())]
    Timeout { name: String, after: Duration },
}

/// A condition still unmet when a sync assertion gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmet {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "sync timed out after {} round(s) and {}ms; unmet: {}",
        rounds,
        .after.as_millis(),
        describe(unmet)
    )]
    Timeout {
        rounds: u32,
        after: Duration,
        unmet: Vec<Unmet>,
    },
    #[error("sync transport failed after {attempts} attempt(s): {reason}")]
    Transport { attempts: u32, reason: String },
    #[error("sync returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid sync response: {0}")]
    InvalidResponse(String),
    #[error("invalid client config: {0}")]
    Config(String),
}

impl SyncError {
    /// Names of the conditions that were never satisfied.
    pub fn unmet_names(&self) -> Vec<&str> {
        match self {
            SyncError::Timeout { unmet, .. } => unmet.iter().map(|u| u.name.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn describe(unmet: &[Unmet]) -> String {
    unmet
        .iter()
        .map(|u| format!("{} ({})", u.name, u.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
