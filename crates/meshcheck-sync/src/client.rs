use std::time::Duration;

use meshcheck_core::config::SyncConfig;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::check::SyncCheck;
use crate::engine::PollingSyncEngine;
use crate::error::SyncError;

/// Extra time allowed on top of the long-poll budget before the HTTP
/// request itself times out.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// Parameters of one `/sync` round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub since: Option<String>,
    /// Server-side long-poll budget.
    pub timeout_millis: u64,
    pub filter: Option<String>,
    pub full_state: bool,
    pub set_presence: Option<String>,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            since: None,
            timeout_millis: 1000,
            filter: None,
            full_state: false,
            set_presence: None,
        }
    }
}

impl SyncRequest {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            timeout_millis: config.long_poll_ms,
            ..Self::default()
        }
    }

    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("timeout", self.timeout_millis.to_string())];
        if let Some(since) = &self.since {
            query.push(("since", since.clone()));
        }
        if let Some(filter) = &self.filter {
            query.push(("filter", filter.clone()));
        }
        if self.full_state {
            query.push(("full_state", "true".to_string()));
        }
        if let Some(presence) = &self.set_presence {
            query.push(("set_presence", presence.clone()));
        }
        query
    }
}

/// Client-server API handle for one user of the server under test.
#[derive(Debug, Clone)]
pub struct CsApiClient {
    http: Client,
    base_url: Url,
    access_token: String,
    config: SyncConfig,
}

impl CsApiClient {
    pub fn new(base_url: &str, access_token: impl Into<String>, config: &SyncConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url).map_err(|e| SyncError::Config(format!("{base_url}: {e}")))?;
        let http = Client::builder()
            .user_agent(concat!("meshcheck/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            access_token: access_token.into(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn sync_url(&self) -> Result<Url, SyncError> {
        self.base_url
            .join("_matrix/client/v3/sync")
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Perform one sync round, returning the body and its `next_batch`.
    /// Transport failures are retried with exponential backoff; an error
    /// status fails immediately.
    pub async fn sync(&self, request: &SyncRequest) -> Result<(Value, String), SyncError> {
        let url = self.sync_url()?;
        let query = request.query();
        let timeout = Duration::from_millis(request.timeout_millis) + REQUEST_SLACK;
        let attempts = self.config.transport_retries.max(1);

        let mut reason = String::new();
        for attempt in 0..attempts {
            let sent = self
                .http
                .get(url.clone())
                .query(&query)
                .bearer_auth(&self.access_token)
                .timeout(timeout)
                .send()
                .await;
            let resp = match sent {
                Ok(resp) => resp,
                Err(e) if is_transport(&e) => {
                    reason = e.to_string();
                    tracing::warn!(attempt, error = %e, "sync transport failure");
                    self.backoff(attempt, attempts).await;
                    continue;
                }
                Err(e) => {
                    return Err(SyncError::Transport {
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    })
                }
            };
            if !resp.status().is_success() {
                return Err(SyncError::Http {
                    status: resp.status().as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            // A body cut off mid-read is a transport failure; only a complete
            // body that is not sync JSON is an invalid response.
            match resp.bytes().await {
                Ok(bytes) => return parse_round(&bytes),
                Err(e) => {
                    reason = e.to_string();
                    tracing::warn!(attempt, error = %e, "sync body read failed");
                }
            }
            self.backoff(attempt, attempts).await;
        }
        Err(SyncError::Transport { attempts, reason })
    }

    async fn backoff(&self, attempt: u32, attempts: u32) {
        if attempt + 1 < attempts {
            tokio::time::sleep(self.config.retry_base_delay() * 2u32.pow(attempt)).await;
        }
    }

    pub async fn must_sync(&self, request: &SyncRequest) -> (Value, String) {
        match self.sync(request).await {
            Ok(round) => round,
            Err(e) => panic!("{e}"),
        }
    }

    /// Sync from `since` until every check holds or `timeout` elapses,
    /// returning the last cursor.
    pub async fn sync_until(
        &self,
        since: Option<&str>,
        timeout: Duration,
        checks: Vec<SyncCheck>,
    ) -> Result<String, SyncError> {
        let mut request = SyncRequest::new(&self.config);
        request.since = since.map(str::to_string);
        PollingSyncEngine::new(self, request, timeout).run(checks).await
    }

    pub async fn must_sync_until(&self, since: Option<&str>, checks: Vec<SyncCheck>) -> String {
        match self.sync_until(since, self.config.timeout(), checks).await {
            Ok(cursor) => cursor,
            Err(e) => panic!("{e}"),
        }
    }
}

fn is_transport(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
}

fn parse_round(bytes: &[u8]) -> Result<(Value, String), SyncError> {
    let body: Value =
        serde_json::from_slice(bytes).map_err(|e| SyncError::InvalidResponse(e.to_string()))?;
    let next_batch = body
        .get("next_batch")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidResponse("missing next_batch".to_string()))?
        .to_string();
    Ok((body, next_batch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_includes_only_set_parameters() {
        let request = SyncRequest::default().since("s1");
        assert_eq!(
            request.query(),
            vec![("timeout", "1000".to_string()), ("since", "s1".to_string())]
        );

        let full = SyncRequest {
            full_state: true,
            set_presence: Some("offline".to_string()),
            ..SyncRequest::default()
        };
        assert!(full.query().contains(&("full_state", "true".to_string())));
        assert!(full.query().contains(&("set_presence", "offline".to_string())));
    }

    #[test]
    fn complete_body_without_cursor_is_invalid() {
        assert!(matches!(parse_round(b"{}"), Err(SyncError::InvalidResponse(_))));
        assert!(matches!(parse_round(b"not json"), Err(SyncError::InvalidResponse(_))));
        let (_, cursor) = parse_round(br#"{"next_batch":"s7"}"#).expect("round");
        assert_eq!(cursor, "s7");
    }

    #[test]
    fn sync_url_joins_base() {
        let client = CsApiClient::new("http://hs1.test:8008/", "token", &SyncConfig::default()).expect("client");
        assert_eq!(
            client.sync_url().expect("url").as_str(),
            "http://hs1.test:8008/_matrix/client/v3/sync"
        );
    }
}
