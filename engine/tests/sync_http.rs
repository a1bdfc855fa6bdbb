//! HTTP sync client against a fake message API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chatsync_engine::sync::{sync_once, HttpSyncClient, SyncError, SyncSource};
use chatsync_engine::{AppState, EngineConfig, LocalStore};
use chatsync_messaging::wire::{RemoteMessage, SyncResponse};
use chatsync_messaging::ConversationId;
use chrono::{DateTime, Duration, Utc};
use tokio::net::TcpListener;

const TOKEN: &str = "secret-token";

#[derive(Clone, Default)]
struct Api {
    messages: Arc<Vec<RemoteMessage>>,
    cursors: Arc<Mutex<Vec<String>>>,
}

async fn sync_handler(
    State(api): State<Api>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<SyncResponse>, (StatusCode, String)> {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"));
    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "invalid token".into()));
    }

    let raw = query.get("lastMessageTimestamp").cloned().unwrap_or_default();
    api.cursors.lock().unwrap().push(raw.clone());
    let cursor = if raw.is_empty() {
        None
    } else {
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
        Some(parsed.with_timezone(&Utc))
    };

    let messages = api
        .messages
        .iter()
        .filter(|m| cursor.map_or(true, |c| m.timestamp > c))
        .cloned()
        .collect();
    Ok(Json(SyncResponse { messages }))
}

async fn serve(api: Api) -> SocketAddr {
    let app = Router::new()
        .route("/messages/sync", get(sync_handler))
        .with_state(api);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn remote(id: &str, ts: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        temp_id: None,
        content: format!("body {id}"),
        sender_id: "bob".into(),
        receiver_id: "alice".into(),
        timestamp: ts,
        created_at: None,
        is_read: false,
        read_at: None,
        is_edited: false,
        edited_at: None,
        deleted_at: None,
    }
}

fn api_with_two_messages() -> (Api, DateTime<Utc>) {
    let base = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.250Z")
        .unwrap()
        .with_timezone(&Utc);
    let api = Api {
        messages: Arc::new(vec![
            remote("m2", base + Duration::seconds(1)),
            remote("m1", base),
        ]),
        ..Api::default()
    };
    (api, base)
}

#[tokio::test]
async fn test_first_sync_sends_empty_cursor_then_latest() {
    let (api, base) = api_with_two_messages();
    let addr = serve(api.clone()).await;
    let client = HttpSyncClient::new(&format!("http://{addr}/"));
    let store = LocalStore::temporary().unwrap();

    let report = sync_once(&store, &client, "alice", TOKEN, None).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.cursor, None);

    let report = sync_once(&store, &client, "alice", TOKEN, None).await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(report.cursor, Some(base + Duration::seconds(1)));

    let cursors = api.cursors.lock().unwrap().clone();
    assert_eq!(cursors, vec![String::new(), "2024-05-01T10:00:01.250Z".to_string()]);
}

#[tokio::test]
async fn test_rejected_credential_is_reported() {
    let (api, _) = api_with_two_messages();
    let addr = serve(api).await;
    let client = HttpSyncClient::new(&format!("http://{addr}"));

    let err = client.fetch_since(None, "wrong").await.unwrap_err();
    match err {
        SyncError::Status { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid token");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_server_keeps_cursor() {
    // bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = LocalStore::temporary().unwrap();
    let config = EngineConfig::default().with_api_base_url(format!("http://{addr}"));
    let state = AppState::new(config, store);
    state.set_current_user("alice");

    assert!(state.sync_messages("alice", TOKEN).await.is_none());
    assert!(state.store().get_last_message_timestamp().is_none());
}

#[tokio::test]
async fn test_state_sync_over_http() {
    let (api, _) = api_with_two_messages();
    let addr = serve(api).await;
    let store = LocalStore::temporary().unwrap();
    let config = EngineConfig::default().with_api_base_url(format!("http://{addr}"));
    let state = AppState::new(config, store);
    state.set_current_user("alice");

    let report = state.sync_messages("alice", TOKEN).await.unwrap();
    assert_eq!(report.inserted, 2);

    let conversation_id = ConversationId::for_participants("alice", "bob");
    let conversations = state.conversations();
    assert_eq!(conversations[0].id, conversation_id);
    assert_eq!(conversations[0].unread_count, 2);
}
