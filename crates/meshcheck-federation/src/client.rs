use std::collections::BTreeMap;
use std::time::Duration;

use meshcheck_events::{version, Event, RoomVersion, ServerIdentity};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use url::Url;

use crate::error::PeerError;
use crate::state::TransactionOutcome;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct MakeMembershipResponse {
    pub room_version: &'static RoomVersion,
    pub event: Value,
}

#[derive(Debug, Clone)]
pub struct SendJoinResponse {
    pub state: Vec<Value>,
    pub auth_chain: Vec<Value>,
    /// The join event as countersigned by the resident server, when returned.
    pub event: Option<Value>,
}

/// Signed server-to-server client used to drive the server under test.
/// Destinations are resolved through an explicit name-to-url map and their
/// certificates are not verified.
#[derive(Debug, Clone)]
pub struct FederationClient {
    http: Client,
    identity: ServerIdentity,
    destinations: BTreeMap<String, String>,
}

impl FederationClient {
    pub fn new(
        identity: ServerIdentity,
        destinations: BTreeMap<String, String>,
    ) -> Result<Self, PeerError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("meshcheck/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| PeerError::Http(e.to_string()))?;
        Ok(Self {
            http,
            identity,
            destinations,
        })
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Add or replace the base url used for `destination`.
    pub fn set_destination(&mut self, destination: impl Into<String>, base_url: impl Into<String>) {
        self.destinations.insert(destination.into(), base_url.into());
    }

    fn url(&self, destination: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, PeerError> {
        let base = self
            .destinations
            .get(destination)
            .ok_or_else(|| PeerError::UnknownDestination(destination.to_string()))?;
        let mut url = Url::parse(base).map_err(|e| PeerError::Http(format!("invalid base url {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| PeerError::Http(format!("{base} cannot be a base url")))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Send a signed request once and decode the JSON answer. Any non-2xx
    /// status is returned as [`PeerError::Remote`]; nothing is retried, so
    /// non-idempotent requests reach the server under test exactly once.
    pub async fn request(
        &self,
        method: Method,
        destination: &str,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, PeerError> {
        let url = self.url(destination, segments, query)?;
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let authorization = self
            .identity
            .request_authorization(method.as_str(), &uri, destination, body)?;

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(reqwest::header::AUTHORIZATION, &authorization);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| PeerError::Http(format!("{method} {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(%url, status = status.as_u16(), "federation request failed");
            return Err(PeerError::Remote {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>().await.map_err(|e| PeerError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Ask `destination` for a proto join event, offering every room version
    /// the emulator understands.
    pub async fn make_join(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<MakeMembershipResponse, PeerError> {
        let versions = version::supported_ids();
        let query: Vec<(&str, &str)> = versions.iter().map(|v| ("ver", *v)).collect();
        let body = self
            .request(
                Method::GET,
                destination,
                &["_matrix", "federation", "v1", "make_join", room_id, user_id],
                &query,
                None,
            )
            .await?;
        let invalid = |reason: &str| PeerError::InvalidResponse {
            url: format!("make_join on {destination}"),
            reason: reason.to_string(),
        };
        let version_id = body
            .get("room_version")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing room_version"))?;
        let room_version = RoomVersion::parse(version_id)?;
        let event = body.get("event").cloned().ok_or_else(|| invalid("missing event"))?;
        Ok(MakeMembershipResponse { room_version, event })
    }

    pub async fn send_join(&self, destination: &str, event: &Event) -> Result<SendJoinResponse, PeerError> {
        let body = self
            .request(
                Method::PUT,
                destination,
                &[
                    "_matrix",
                    "federation",
                    "v2",
                    "send_join",
                    event.room_id(),
                    event.event_id(),
                ],
                &[],
                Some(event.json()),
            )
            .await?;
        let events = |key: &str| -> Result<Vec<Value>, PeerError> {
            body.get(key)
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| PeerError::InvalidResponse {
                    url: format!("send_join on {destination}"),
                    reason: format!("missing {key}"),
                })
        };
        Ok(SendJoinResponse {
            state: events("state")?,
            auth_chain: events("auth_chain")?,
            event: body.get("event").cloned(),
        })
    }

    pub async fn send_transaction(
        &self,
        destination: &str,
        txn_id: &str,
        pdus: &[Value],
        edus: &[Value],
    ) -> Result<TransactionOutcome, PeerError> {
        let payload = json!({
            "origin": self.identity.server_name(),
            "origin_server_ts": chrono::Utc::now().timestamp_millis(),
            "pdus": pdus,
            "edus": edus,
        });
        let body = self
            .request(
                Method::PUT,
                destination,
                &["_matrix", "federation", "v1", "send", txn_id],
                &[],
                Some(&payload),
            )
            .await?;
        let mut outcome = TransactionOutcome::new();
        if let Some(results) = body.get("pdus").and_then(Value::as_object) {
            for (event_id, result) in results {
                let entry = match result.get("error").and_then(Value::as_str) {
                    Some(reason) => Err(reason.to_string()),
                    None => Ok(()),
                };
                outcome.insert(event_id.clone(), entry);
            }
        }
        Ok(outcome)
    }
}
