use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use meshcheck_core::config::SyncConfig;
use meshcheck_sync::{custom, joined_to, CsApiClient, SyncError, SyncRequest};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const ROOM: &str = "!r:hs1";
const USER: &str = "@a:hs1";

/// Fake homeserver whose sync reports the join from round `joined_from` on.
struct MockSync {
    joined_from: usize,
    requests: AtomicUsize,
    sinces: Mutex<Vec<Option<String>>>,
}

async fn sync(
    State(mock): State<Arc<MockSync>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer secret") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let round = mock.requests.fetch_add(1, Ordering::SeqCst) + 1;
    mock.sinces.lock().unwrap().push(params.get("since").cloned());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let join = if round >= mock.joined_from {
        json!({ ROOM: { "timeline": { "events": [{
            "type": "m.room.member",
            "state_key": USER,
            "sender": USER,
            "content": { "membership": "join" },
        }]}}})
    } else {
        json!({})
    };
    Ok(Json(json!({ "next_batch": format!("s{round}"), "rooms": { "join": join } })))
}

async fn serve(app: Router) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/"))
}

async fn mock_server(joined_from: usize) -> anyhow::Result<(CsApiClient, Arc<MockSync>, String)> {
    let mock = Arc::new(MockSync {
        joined_from,
        requests: AtomicUsize::new(0),
        sinces: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/_matrix/client/v3/sync", get(sync))
        .with_state(mock.clone());
    let base = serve(app).await?;
    let client = CsApiClient::new(&base, "secret", &SyncConfig::default())?;
    Ok((client, mock, base))
}

#[tokio::test]
async fn satisfied_condition_needs_one_round() -> anyhow::Result<()> {
    let (client, mock, _) = mock_server(1).await?;
    let cursor = client
        .sync_until(None, Duration::from_secs(5), vec![joined_to(USER, ROOM)])
        .await?;
    assert_eq!(cursor, "s1");
    assert_eq!(mock.requests.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn cursor_threads_through_rounds() -> anyhow::Result<()> {
    let (client, mock, _) = mock_server(3).await?;
    let evaluations = Arc::new(AtomicUsize::new(0));
    let counted = evaluations.clone();
    let always = custom("always", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let cursor = client
        .sync_until(Some("s0"), Duration::from_secs(5), vec![always, joined_to(USER, ROOM)])
        .await?;
    assert_eq!(cursor, "s3");
    assert_eq!(
        *mock.sinces.lock().unwrap(),
        vec![Some("s0".to_string()), Some("s1".to_string()), Some("s2".to_string())]
    );
    // satisfied in the first round and never looked at again
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn timeout_lists_only_unmet_conditions() -> anyhow::Result<()> {
    let (client, _, _) = mock_server(usize::MAX).await?;
    let err = client
        .sync_until(
            None,
            Duration::from_millis(500),
            vec![custom("always", |_| Ok(())), joined_to(USER, ROOM)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout { .. }), "{err}");
    assert_eq!(err.unmet_names(), vec!["joined_to(@a:hs1, !r:hs1)"]);
    assert!(err.to_string().contains("!r:hs1 not in rooms.join"), "{err}");
    Ok(())
}

#[tokio::test]
async fn error_status_is_fatal() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let app = Router::new().route(
        "/_matrix/client/v3/sync",
        get(move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }
        }),
    );
    let client = CsApiClient::new(&serve(app).await?, "secret", &SyncConfig::default())?;
    let err = client
        .sync_until(None, Duration::from_secs(5), vec![joined_to(USER, ROOM)])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 500, ref body } if body == "boom"), "{err}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn wrong_token_is_reported_as_http_error() -> anyhow::Result<()> {
    let (_, _, base) = mock_server(1).await?;
    let intruder = CsApiClient::new(&base, "wrong", &SyncConfig::default())?;
    let err = intruder.sync(&SyncRequest::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 401, .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn must_sync_returns_body_and_cursor() -> anyhow::Result<()> {
    let (client, mock, _) = mock_server(1).await?;
    let (body, cursor) = client.must_sync(&SyncRequest::default().since("s9")).await;
    assert_eq!(cursor, "s1");
    assert!(body["rooms"]["join"].get(ROOM).is_some());
    assert_eq!(*mock.sinces.lock().unwrap(), vec![Some("s9".to_string())]);
    Ok(())
}

/// Raw socket server whose first connection misbehaves: it is dropped
/// unanswered, or sent `first_reply` and closed. Later connections get a
/// healthy sync answer. Returns the base url and the connection counter.
async fn flaky_server(first_reply: Option<&'static str>) -> anyhow::Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let seen = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let first = seen.fetch_add(1, Ordering::SeqCst) == 0;
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                if first {
                    if let Some(reply) = first_reply {
                        let _ = socket.read(&mut buf).await;
                        let _ = socket.write_all(reply.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    return;
                }
                let _ = socket.read(&mut buf).await;
                let body = r#"{"next_batch":"s1"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok((format!("http://{addr}/"), connections))
}

#[tokio::test]
async fn transport_failure_is_retried() -> anyhow::Result<()> {
    let (base, connections) = flaky_server(None).await?;
    let client = CsApiClient::new(&base, "secret", &SyncConfig::default())?;
    let cursor = client
        .sync_until(None, Duration::from_secs(5), vec![custom("any", |_| Ok(()))])
        .await?;
    assert_eq!(cursor, "s1");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn truncated_body_is_retried() -> anyhow::Result<()> {
    let (base, connections) = flaky_server(Some(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n{\"next_batch\":",
    ))
    .await?;
    let client = CsApiClient::new(&base, "secret", &SyncConfig::default())?;
    let (_, cursor) = client.sync(&SyncRequest::default()).await?;
    assert_eq!(cursor, "s1");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    Ok(())
}
