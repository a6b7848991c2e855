use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meshcheck_events::EventError;
use serde_json::json;
use thiserror::Error;

/// Protocol errors a handler answers with. Each maps to a Matrix `errcode`.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotJson(String),
    #[error("{0}")]
    BadJson(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    UnsupportedRoomVersion(String),
    #[error("room version {room_version} not supported by the joining server")]
    IncompatibleRoomVersion { room_version: String },
    #[error("{0}")]
    Unrecognized(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl FederationError {
    pub fn errcode(&self) -> &'static str {
        match self {
            FederationError::NotFound(_) => "M_NOT_FOUND",
            FederationError::NotJson(_) => "M_NOT_JSON",
            FederationError::BadJson(_) => "M_BAD_JSON",
            FederationError::Forbidden(_) => "M_FORBIDDEN",
            FederationError::UnsupportedRoomVersion(_) => "M_UNSUPPORTED_ROOM_VERSION",
            FederationError::IncompatibleRoomVersion { .. } => "M_INCOMPATIBLE_ROOM_VERSION",
            FederationError::Unrecognized(_) => "M_UNRECOGNIZED",
            FederationError::Internal(_) => "M_UNKNOWN",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            FederationError::NotFound(_) | FederationError::Unrecognized(_) => StatusCode::NOT_FOUND,
            FederationError::Forbidden(_) => StatusCode::FORBIDDEN,
            FederationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "errcode": self.errcode(), "error": self.to_string() });
        match &self {
            FederationError::IncompatibleRoomVersion { room_version } => {
                body["room_version"] = json!(room_version);
            }
            FederationError::Internal(err) => {
                tracing::error!("federation handler internal error: {err:#}");
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

impl From<EventError> for FederationError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::UnknownRoomVersion(v) => {
                FederationError::UnsupportedRoomVersion(format!("unsupported room version {v}"))
            }
            EventError::InvalidEvent(msg) | EventError::InvalidSignature(msg) => {
                FederationError::BadJson(msg)
            }
            EventError::MissingAuthState(msg) | EventError::GraphViolation(msg) => {
                FederationError::Forbidden(msg)
            }
        }
    }
}

/// Failures of the peer's own operations: listening, outbound requests and
/// composite helpers.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("http error: {0}")]
    Http(String),
    #[error("request to {url} returned {status}: {body}")]
    Remote { url: String, status: u16, body: String },
    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
    #[error("no base url configured for destination {0}")]
    UnknownDestination(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("peer is already listening")]
    AlreadyListening,
    #[error("unknown room {0}")]
    UnknownRoom(String),
    #[error("federation peer received {} unexpected request(s): {}", .0.len(), .0.join(", "))]
    UnexpectedRequests(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn bodies_carry_errcode_and_message() {
        let response = FederationError::Forbidden("not your user".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["errcode"], "M_FORBIDDEN");
        assert_eq!(body["error"], "not your user");
    }

    #[test]
    fn event_errors_map_to_protocol_codes() {
        assert_eq!(
            FederationError::from(EventError::UnknownRoomVersion("2".into())).errcode(),
            "M_UNSUPPORTED_ROOM_VERSION"
        );
        assert_eq!(
            FederationError::from(EventError::InvalidEvent("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn unexpected_requests_are_listed() {
        let err = PeerError::UnexpectedRequests(vec!["GET /a".into(), "PUT /b".into()]);
        assert_eq!(
            err.to_string(),
            "federation peer received 2 unexpected request(s): GET /a, PUT /b"
        );
    }
}
