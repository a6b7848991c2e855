use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::check::SyncCheck;
use crate::client::{CsApiClient, SyncRequest};
use crate::error::{SyncError, Unmet};

/// Drives repeated sync rounds for a single assertion.
#[derive(Debug)]
pub struct PollingSyncEngine<'a> {
    client: &'a CsApiClient,
    request: SyncRequest,
    timeout: Duration,
}

impl<'a> PollingSyncEngine<'a> {
    pub fn new(client: &'a CsApiClient, request: SyncRequest, timeout: Duration) -> Self {
        Self {
            client,
            request,
            timeout,
        }
    }

    /// Poll until every check has held at least once. Each round uses the
    /// previous round's `next_batch` and evaluates only the checks not yet
    /// satisfied. Returns the cursor of the final round.
    pub async fn run(self, checks: Vec<SyncCheck>) -> Result<String, SyncError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let long_poll = self.request.timeout_millis;
        let mut request = self.request;
        let mut pending: Vec<(SyncCheck, String)> = checks
            .into_iter()
            .map(|check| (check, "no sync response yet".to_string()))
            .collect();
        let mut rounds = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            request.timeout_millis = long_poll.min(remaining.as_millis() as u64);

            let (body, next_batch) = match timeout_at(deadline, self.client.sync(&request)).await {
                Ok(round) => round?,
                Err(_) => return Err(timed_out(rounds, started, pending)),
            };
            rounds += 1;

            pending.retain_mut(|(check, reason)| match check.evaluate(&body) {
                Ok(()) => {
                    tracing::debug!(check = check.name(), rounds, "sync condition met");
                    false
                }
                Err(why) => {
                    *reason = why;
                    true
                }
            });
            request.since = Some(next_batch.clone());

            if pending.is_empty() {
                return Ok(next_batch);
            }
            if Instant::now() >= deadline {
                return Err(timed_out(rounds, started, pending));
            }
        }
    }
}

fn timed_out(rounds: u32, started: Instant, pending: Vec<(SyncCheck, String)>) -> SyncError {
    SyncError::Timeout {
        rounds,
        after: started.elapsed(),
        unmet: pending
            .into_iter()
            .map(|(check, reason)| Unmet {
                name: check.name().to_string(),
                reason,
            })
            .collect(),
    }
}
