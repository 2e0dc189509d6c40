use super::*;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode as AxumStatus},
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::protocol::RefreshResponse;
use tokio::{net::TcpListener, sync::broadcast};

use crate::{credentials::CredentialPair, ClientEvent};

#[derive(Clone)]
struct ApiServer {
    refresh_calls: Arc<AtomicUsize>,
    seen_tokens: Arc<Mutex<Vec<Option<String>>>>,
    accept_refreshed: bool,
    reject_refresh: bool,
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn handle_history(State(server): State<ApiServer>, headers: HeaderMap) -> AxumResponse {
    let token = bearer_of(&headers);
    server
        .seen_tokens
        .lock()
        .expect("tokens lock")
        .push(token.clone());
    if server.accept_refreshed && token.as_deref() == Some("access-2") {
        return Json(serde_json::json!([])).into_response();
    }
    (
        AxumStatus::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "token expired" })),
    )
        .into_response()
}

async fn handle_refresh(State(server): State<ApiServer>) -> AxumResponse {
    server.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    if server.reject_refresh {
        return (
            AxumStatus::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "refresh token revoked" })),
        )
            .into_response();
    }
    Json(RefreshResponse {
        access_token: "access-2".into(),
        refresh_token: "refresh-2".into(),
        expires_in: 900,
    })
    .into_response()
}

async fn spawn_api_server(accept_refreshed: bool) -> Result<(String, ApiServer)> {
    spawn_api_server_with(accept_refreshed, false).await
}

async fn spawn_api_server_with(
    accept_refreshed: bool,
    reject_refresh: bool,
) -> Result<(String, ApiServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = ApiServer {
        refresh_calls: Arc::new(AtomicUsize::new(0)),
        seen_tokens: Arc::new(Mutex::new(Vec::new())),
        accept_refreshed,
        reject_refresh,
    };
    let app = Router::new()
        .route("/api/channels/c-1/messages", get(handle_history))
        .route(REFRESH_PATH, post(handle_refresh))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), server))
}

async fn guard_for(
    base_url: &str,
    logged_in: bool,
) -> (RequestGuard, broadcast::Receiver<ClientEvent>) {
    let store = Arc::new(CredentialStore::in_memory());
    if logged_in {
        store
            .replace(CredentialPair::new(
                "access-1",
                "refresh-1",
                Utc::now() + chrono::Duration::minutes(10),
            ))
            .await;
    }
    let (events, rx) = broadcast::channel(64);
    let refresh = Arc::new(RefreshCoordinator::new(
        Client::new(),
        base_url,
        store,
        events,
        Duration::from_secs(5),
    ));
    (RequestGuard::new(Client::new(), base_url, refresh), rx)
}

fn session_expired_count(rx: &mut broadcast::Receiver<ClientEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ClientEvent::SessionExpired { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn concurrent_unauthorized_requests_trigger_one_refresh() {
    let (base_url, server) = spawn_api_server(true).await.expect("spawn server");
    let (guard, mut events) = guard_for(&base_url, true).await;
    let guard = Arc::new(guard);

    let responses = futures::future::join_all((0..5).map(|_| {
        let guard = guard.clone();
        async move {
            guard
                .execute(GuardedRequest::get("/api/channels/c-1/messages"))
                .await
        }
    }))
    .await;

    for response in responses {
        assert_eq!(response.expect("request").status(), StatusCode::OK);
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);

    let tokens = server.seen_tokens.lock().expect("tokens lock").clone();
    assert_eq!(tokens.len(), 10);
    assert_eq!(
        tokens
            .iter()
            .filter(|token| token.as_deref() == Some("access-2"))
            .count(),
        5
    );
    assert_eq!(session_expired_count(&mut events), 0);
}

#[tokio::test]
async fn replay_rejected_again_ends_session_once() {
    let (base_url, server) = spawn_api_server(false).await.expect("spawn server");
    let (guard, mut events) = guard_for(&base_url, true).await;

    let err = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages"))
        .await
        .expect_err("still unauthorized");

    assert!(matches!(err, ClientError::RefreshFailed(_)));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(!guard.credentials().has_session().await);
    assert_eq!(session_expired_count(&mut events), 1);

    let err = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages"))
        .await
        .expect_err("no session left");
    assert_eq!(err, ClientError::AuthExpired);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session_expired_count(&mut events), 0);
}

#[tokio::test]
async fn stored_token_is_attached_and_explicit_token_wins() {
    let (base_url, server) = spawn_api_server(true).await.expect("spawn server");
    let (guard, _events) = guard_for(&base_url, true).await;

    let response = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages").bearer("access-2"))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);

    let _ = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages"))
        .await
        .expect("request");
    let tokens = server.seen_tokens.lock().expect("tokens lock").clone();
    assert_eq!(tokens[0].as_deref(), Some("access-2"));
    assert_eq!(tokens[1].as_deref(), Some("access-1"));
}

#[tokio::test]
async fn other_error_statuses_pass_through() {
    let (base_url, server) = spawn_api_server(true).await.expect("spawn server");
    let (guard, _events) = guard_for(&base_url, true).await;

    let response = guard
        .execute(GuardedRequest::get("/api/unknown"))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let err = guard
        .send_json::<Vec<serde_json::Value>>(GuardedRequest::get("/api/unknown"))
        .await
        .expect_err("not found");
    assert!(matches!(err, ClientError::Api { status: 404, .. }));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unauthorized_without_session_does_not_refresh() {
    let (base_url, server) = spawn_api_server(true).await.expect("spawn server");
    let (guard, mut events) = guard_for(&base_url, false).await;

    let err = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages"))
        .await
        .expect_err("no session");

    assert_eq!(err, ClientError::AuthExpired);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(session_expired_count(&mut events), 0);
}

#[tokio::test]
async fn rejected_refresh_ends_session_once_for_concurrent_requests() {
    let (base_url, server) = spawn_api_server_with(true, true)
        .await
        .expect("spawn server");
    let (guard, mut events) = guard_for(&base_url, true).await;
    let guard = Arc::new(guard);

    let responses = futures::future::join_all((0..5).map(|_| {
        let guard = guard.clone();
        async move {
            guard
                .execute(GuardedRequest::get("/api/channels/c-1/messages"))
                .await
        }
    }))
    .await;

    for response in responses {
        let err = response.expect_err("refresh was rejected");
        assert!(
            matches!(err, ClientError::RefreshFailed(_) | ClientError::AuthExpired),
            "unexpected error: {err:?}"
        );
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session_expired_count(&mut events), 1);
    assert!(!guard.credentials().has_session().await);

    // a request after the redirect fails fast without another refresh
    let err = guard
        .execute(GuardedRequest::get("/api/channels/c-1/messages"))
        .await
        .expect_err("logged out");
    assert_eq!(err, ClientError::AuthExpired);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session_expired_count(&mut events), 0);
}
