use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::WaitError;

/// One-shot signal between a handler and the test body. Clones share the
/// same signal.
#[derive(Debug, Clone)]
pub struct Waiter {
    name: Arc<str>,
    token: CancellationToken,
}

impl Waiter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release every current and future waiter. Idempotent.
    pub fn finish(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(waiter = %self.name, "finished");
        }
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        tokio::time::timeout(timeout, self.token.cancelled())
            .await
            .map_err(|_| WaitError::Timeout {
                name: self.name.to_string(),
                after: timeout,
            })
    }

    /// Like [`Waiter::wait`], panicking on timeout.
    pub async fn must_wait(&self, timeout: Duration) {
        if let Err(e) = self.wait(timeout).await {
            panic!("{e}");
        }
    }
}
