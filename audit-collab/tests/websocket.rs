//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on an ephemeral port and talks to it with
//! `SyncClient` or with raw tungstenite frames.

use std::sync::Arc;

use audit_collab::schema;
use audit_collab::server::{USER_ID_HEADER, USER_NAME_HEADER};
use audit_collab::{
    ClientEvent, CollabConfig, ConnectionState, DocumentId, ErrorCode, Replica, ServerConfig,
    ServerMessage, SessionRouter, SyncClient, SyncServer, UserId, WireCodec,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use yrs::Transact;

/// Start a server on a free port. Returns its URL and router.
async fn start_test_server() -> (String, Arc<SessionRouter>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        storage_path: None,
        collab: CollabConfig::for_testing(),
    };
    let server = SyncServer::new(config).unwrap();
    let router = server.router().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://{addr}"), router)
}

async fn connected_client(
    url: &str,
    user: &str,
    codec: WireCodec,
) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let mut client = SyncClient::new(user, user.to_uppercase(), url).with_codec(codec);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

/// Wait for the first server message matching `pred`.
async fn expect_message(
    events: &mut mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Message(msg)) if pred(&msg) => return msg,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for server message")
}

#[tokio::test]
async fn test_handshake_without_identity_is_refused() {
    let (url, router) = start_test_server().await;

    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_err());
    assert_eq!(router.connection_count(), 0);
}

#[tokio::test]
async fn test_client_connects_and_pings() {
    let (url, _router) = start_test_server().await;
    let (client, mut events) = connected_client(&url, "alice", WireCodec::Binary).await;

    assert_eq!(events.recv().await, Some(ClientEvent::Connected));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.ping().await.unwrap();
    let pong = expect_message(&mut events, |m| matches!(m, ServerMessage::Pong { .. })).await;
    assert!(matches!(pong, ServerMessage::Pong { timestamp } if timestamp > 0));
}

#[tokio::test]
async fn test_binary_and_json_clients_collaborate() {
    let (url, router) = start_test_server().await;
    let doc = DocumentId::from("D1");
    let (alice, mut alice_events) = connected_client(&url, "alice", WireCodec::Binary).await;
    let (bob, mut bob_events) = connected_client(&url, "bob", WireCodec::Json).await;

    alice.join("D1").await.unwrap();
    let sync = expect_message(&mut alice_events, |m| matches!(m, ServerMessage::Sync { .. })).await;
    assert!(matches!(sync, ServerMessage::Sync { full: true, .. }));

    bob.join("D1").await.unwrap();
    expect_message(&mut bob_events, |m| matches!(m, ServerMessage::Sync { .. })).await;
    let joined = expect_message(&mut alice_events, |m| {
        matches!(m, ServerMessage::UserJoined { .. })
    })
    .await;
    match joined {
        ServerMessage::UserJoined { user, .. } => assert_eq!(user.display_name, "BOB"),
        other => panic!("unexpected {other:?}"),
    }

    // Alice edits, Bob receives the delta over JSON
    let local = Replica::empty();
    {
        let mut txn = local.doc().transact_mut();
        schema::append_title(&mut txn, "FY24 audit");
    }
    alice.send_update("D1", local.encode_state()).await.unwrap();

    let update = expect_message(&mut bob_events, |m| matches!(m, ServerMessage::Update { .. })).await;
    let bob_replica = Replica::empty();
    match update {
        ServerMessage::Update {
            document_id,
            delta,
            origin,
        } => {
            assert_eq!(document_id, doc);
            assert_eq!(origin, UserId::from("alice"));
            bob_replica.apply(&delta).unwrap();
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bob_replica.content().title, "FY24 audit");
    assert_eq!(
        router.service().content(&doc).await.unwrap().title,
        "FY24 audit"
    );

    bob.save().await.unwrap();
    let saved = expect_message(&mut bob_events, |m| matches!(m, ServerMessage::Saved { .. })).await;
    assert!(matches!(saved, ServerMessage::Saved { success: true, .. }));
}

#[tokio::test]
async fn test_disconnect_leaves_document() {
    let (url, router) = start_test_server().await;
    let (mut alice, _alice_events) = connected_client(&url, "alice", WireCodec::Binary).await;
    let (bob, mut bob_events) = connected_client(&url, "bob", WireCodec::Binary).await;

    alice.join("D1").await.unwrap();
    bob.join("D1").await.unwrap();
    expect_message(&mut bob_events, |m| matches!(m, ServerMessage::Sync { .. })).await;

    alice.disconnect();
    let left = expect_message(&mut bob_events, |m| matches!(m, ServerMessage::UserLeft { .. })).await;
    assert!(matches!(left, ServerMessage::UserLeft { user_id, .. } if user_id == UserId::from("alice")));

    timeout(Duration::from_secs(5), async {
        while router.connection_count() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not forgotten");
}

#[tokio::test]
async fn test_malformed_frame_gets_error_reply() {
    let (url, _router) = start_test_server().await;

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(USER_ID_HEADER, HeaderValue::from_static("mallory"));
    request
        .headers_mut()
        .insert(USER_NAME_HEADER, HeaderValue::from_static("Mallory"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ws.send(Message::Text("{\"teleport\":{}}".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match reply {
        Message::Text(text) => text,
        other => panic!("expected a text reply, got {other:?}"),
    };
    let msg: ServerMessage = WireCodec::Json.decode(text.as_str().as_bytes()).unwrap();
    assert!(matches!(
        msg,
        ServerMessage::Error {
            code: ErrorCode::MalformedMessage,
            ..
        }
    ));

    // The connection stays usable
    ws.send(Message::Text("{\"ping\":{\"timestamp\":9}}".into()))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match reply {
        Message::Text(text) => text,
        other => panic!("expected a text reply, got {other:?}"),
    };
    assert_eq!(text.as_str(), r#"{"pong":{"timestamp":9}}"#);
}

#[tokio::test]
async fn test_requests_before_join_report_not_joined() {
    let (url, _router) = start_test_server().await;
    let (client, mut events) = connected_client(&url, "alice", WireCodec::Json).await;

    client.lock().await.unwrap();
    let err = expect_message(&mut events, |m| matches!(m, ServerMessage::Error { .. })).await;
    assert!(matches!(
        err,
        ServerMessage::Error {
            code: ErrorCode::NotJoined,
            ..
        }
    ));
}
