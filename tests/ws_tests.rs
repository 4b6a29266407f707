//! End-to-end tests for the socket endpoint on a single instance.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use roomcast::auth::{Claims, StaticTokenVerifier};
use roomcast::config::DeliveryConfig;
use roomcast::protocol::{Envelope, ErrorCode, ServerFrame};
use roomcast::repo::memory::{MemoryStore, RecordingPushSink};
use roomcast::repo::{StoredChatMessage, UserRepo, UserStatus};
use roomcast::ws::Hub;
use roomcast::{create_router, AppState};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("roomcast=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn claims(subject: &str, email: &str, name: &str) -> Claims {
    Claims {
        subject: subject.into(),
        email: email.into(),
        preferred_name: name.into(),
    }
}

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    push: Arc<RecordingPushSink>,
    /// alice, bob, carol, dave
    user_ids: [u64; 4],
}

/// Starts an instance with four known users; alice, bob and carol are
/// members of room 7, dave is a member of nothing.
async fn start_test_server_with(config: DeliveryConfig) -> TestServer {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    let mut user_ids = [0u64; 4];
    for (i, (subject, email, name)) in [
        ("sub-alice", "alice@example.com", "Alice"),
        ("sub-bob", "bob@example.com", "Bob"),
        ("sub-carol", "carol@example.com", "Carol"),
        ("sub-dave", "dave@example.com", "Dave"),
    ]
    .into_iter()
    .enumerate()
    {
        let user = store
            .get_or_create_from_claims(&claims(subject, email, name))
            .await
            .unwrap();
        user_ids[i] = user.id;
    }

    store.add_room(7, "general").await;
    for id in &user_ids[..3] {
        store.add_member(7, *id).await;
    }

    let verifier = StaticTokenVerifier::new()
        .with_token("tok-alice", claims("sub-alice", "alice@example.com", "Alice"))
        .with_token("tok-bob", claims("sub-bob", "bob@example.com", "Bob"))
        .with_token("tok-carol", claims("sub-carol", "carol@example.com", "Carol"))
        .with_token("tok-dave", claims("sub-dave", "dave@example.com", "Dave"));

    let push = Arc::new(RecordingPushSink::new());
    let state = AppState {
        hub: Arc::new(Hub::new()),
        verifier: Arc::new(verifier),
        users: store.clone(),
        members: store.clone(),
        messages: store.clone(),
        push: push.clone(),
        config,
    };
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        store,
        push,
        user_ids,
    }
}

async fn start_test_server() -> TestServer {
    start_test_server_with(DeliveryConfig::default()).await
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

async fn connect_ws(addr: &SocketAddr, token: &str) -> (WsWrite, WsRead) {
    let request = format!("ws://{addr}/ws?token={token}")
        .into_client_request()
        .unwrap();
    let (stream, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream.split()
}

async fn send_json(write: &mut WsWrite, value: serde_json::Value) {
    write.send(Message::Text(value.to_string())).await.unwrap();
}

/// Receives frames until one matches, skipping everything else.
async fn recv_until<F>(read: &mut WsRead, pred: F) -> Envelope
where
    F: Fn(&Envelope) -> bool,
{
    loop {
        match tokio::time::timeout(TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let envelope = Envelope::decode(text.as_bytes()).unwrap();
                if pred(&envelope) {
                    return envelope;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => panic!("connection closed while waiting"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("websocket error: {e}"),
            Ok(None) => panic!("stream ended while waiting"),
            Err(_) => panic!("timeout waiting for frame"),
        }
    }
}

/// Asserts that no matching frame arrives within the window.
async fn assert_quiet<F>(read: &mut WsRead, pred: F)
where
    F: Fn(&Envelope) -> bool,
{
    let deadline = tokio::time::Instant::now() + QUIET;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return;
        }
        match tokio::time::timeout(deadline - now, read.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let envelope = Envelope::decode(text.as_bytes()).unwrap();
                assert!(!pred(&envelope), "unexpected frame: {envelope:?}");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return,
        }
    }
}

async fn join_room(write: &mut WsWrite, read: &mut WsRead, room_id: u64) {
    send_json(
        write,
        serde_json::json!({"type": "join_room", "payload": {"room_id": room_id}}),
    )
    .await;
    recv_until(read, |e| {
        matches!(e.frame, ServerFrame::RoomJoined(r) if r.room_id == room_id)
    })
    .await;
}

fn is_new_message(envelope: &Envelope) -> bool {
    matches!(envelope.frame, ServerFrame::NewMessage(_))
}

#[tokio::test]
async fn single_instance_broadcast_reaches_every_member() {
    let server = start_test_server().await;
    let [alice_id, ..] = server.user_ids;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    let (mut write_c, mut read_c) = connect_ws(&server.addr, "tok-carol").await;

    join_room(&mut write_a, &mut read_a, 7).await;
    join_room(&mut write_b, &mut read_b, 7).await;
    join_room(&mut write_c, &mut read_c, 7).await;

    send_json(
        &mut write_a,
        serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": "hi"}}),
    )
    .await;

    let mut seen_id = None;
    for read in [&mut read_a, &mut read_b, &mut read_c] {
        let envelope = recv_until(read, is_new_message).await;
        let ServerFrame::NewMessage(payload) = envelope.frame else {
            unreachable!()
        };
        assert_eq!(payload.content, "hi");
        assert_eq!(payload.room_id, 7);
        assert_eq!(payload.sender.id, alice_id);
        // Three authoritative members, sender excluded, none caught up.
        assert_eq!(payload.unread_count, 2);
        match seen_id {
            None => seen_id = Some(payload.id),
            Some(id) => assert_eq!(payload.id, id),
        }
    }

    // Persisted exactly once.
    let rows: Vec<StoredChatMessage> = reqwest::Client::new()
        .get(format!(
            "http://{}/rooms/7/messages?after_id=0&token=tok-alice",
            server.addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(Some(rows[0].id), seen_id);

    // Fire-and-forget push went out once, excluding the sender.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = server.push.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, 7);
    assert_eq!(calls[0].1, alice_id);
}

#[tokio::test]
async fn non_member_join_gets_error_with_echoed_request_id() {
    let server = start_test_server().await;

    let (mut write_d, mut read_d) = connect_ws(&server.addr, "tok-dave").await;
    send_json(
        &mut write_d,
        serde_json::json!({
            "type": "join_room",
            "payload": {"room_id": 9},
            "request_id": "req-42"
        }),
    )
    .await;

    let envelope = recv_until(&mut read_d, |e| {
        matches!(e.frame, ServerFrame::Error(_))
    })
    .await;
    let ServerFrame::Error(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.code, ErrorCode::NotMember);
    assert_eq!(payload.request_id.as_deref(), Some("req-42"));

    // The connection survives the rejection.
    send_json(&mut write_d, serde_json::json!({"type": "ping"})).await;
    recv_until(&mut read_d, |e| matches!(e.frame, ServerFrame::Pong)).await;
}

#[tokio::test]
async fn invalid_json_yields_error_and_keeps_the_connection() {
    let server = start_test_server().await;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    write_a
        .send(Message::Text("{definitely not json".into()))
        .await
        .unwrap();

    let envelope = recv_until(&mut read_a, |e| {
        matches!(e.frame, ServerFrame::Error(_))
    })
    .await;
    let ServerFrame::Error(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.code, ErrorCode::InvalidMessage);

    send_json(&mut write_a, serde_json::json!({"type": "ping"})).await;
    recv_until(&mut read_a, |e| matches!(e.frame, ServerFrame::Pong)).await;
}

#[tokio::test]
async fn unknown_frame_type_is_reported() {
    let server = start_test_server().await;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    send_json(
        &mut write_a,
        serde_json::json!({"type": "dance", "request_id": "req-7"}),
    )
    .await;

    let envelope = recv_until(&mut read_a, |e| {
        matches!(e.frame, ServerFrame::Error(_))
    })
    .await;
    let ServerFrame::Error(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.code, ErrorCode::UnknownType);
    assert_eq!(payload.request_id.as_deref(), Some("req-7"));
}

#[tokio::test]
async fn empty_message_content_is_rejected() {
    let server = start_test_server().await;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    join_room(&mut write_a, &mut read_a, 7).await;

    send_json(
        &mut write_a,
        serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": ""}}),
    )
    .await;

    let envelope = recv_until(&mut read_a, |e| {
        matches!(e.frame, ServerFrame::Error(_))
    })
    .await;
    let ServerFrame::Error(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.code, ErrorCode::EmptyContent);
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    let server = start_test_server_with(DeliveryConfig {
        max_frame_bytes: 1024,
        ..DeliveryConfig::default()
    })
    .await;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    let huge = "x".repeat(4096);
    let _ = write_a
        .send(Message::Text(format!(
            "{{\"type\":\"send_message\",\"payload\":{{\"room_id\":7,\"content\":\"{huge}\"}}}}"
        )))
        .await;

    // The server drops the socket without any error frame.
    let closed = tokio::time::timeout(TIMEOUT, async {
        loop {
            match read_a.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "expected the connection to close");
}

#[tokio::test]
async fn typing_is_broadcast_to_everyone_but_the_sender() {
    let server = start_test_server().await;
    let [alice_id, ..] = server.user_ids;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    join_room(&mut write_a, &mut read_a, 7).await;
    join_room(&mut write_b, &mut read_b, 7).await;

    send_json(
        &mut write_a,
        serde_json::json!({"type": "typing", "payload": {"room_id": 7, "is_typing": true}}),
    )
    .await;

    let envelope = recv_until(&mut read_b, |e| {
        matches!(e.frame, ServerFrame::UserTyping(_))
    })
    .await;
    let ServerFrame::UserTyping(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.user_id, alice_id);
    assert!(payload.is_typing);

    // Per-recipient FIFO: if alice had been included, user_typing would
    // land before the pong.
    send_json(&mut write_a, serde_json::json!({"type": "ping"})).await;
    let envelope = recv_until(&mut read_a, |e| {
        matches!(
            e.frame,
            ServerFrame::Pong | ServerFrame::UserTyping(_)
        )
    })
    .await;
    assert!(matches!(envelope.frame, ServerFrame::Pong));
}

#[tokio::test]
async fn mark_read_updates_watermark_and_notifies_others() {
    let server = start_test_server().await;
    let [alice_id, bob_id, ..] = server.user_ids;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    join_room(&mut write_a, &mut read_a, 7).await;
    join_room(&mut write_b, &mut read_b, 7).await;

    send_json(
        &mut write_a,
        serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": "one"}}),
    )
    .await;
    recv_until(&mut read_b, is_new_message).await;

    send_json(
        &mut write_b,
        serde_json::json!({"type": "mark_read", "payload": {"room_id": 7, "message_id": 1}}),
    )
    .await;
    let envelope = recv_until(&mut read_a, |e| {
        matches!(e.frame, ServerFrame::MessageRead(_))
    })
    .await;
    let ServerFrame::MessageRead(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.user_id, bob_id);

    // Bob is caught up now; the next message counts only carol as unread.
    send_json(
        &mut write_a,
        serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": "two"}}),
    )
    .await;
    let envelope = recv_until(&mut read_a, |e| {
        matches!(&e.frame, ServerFrame::NewMessage(p) if p.content == "two")
    })
    .await;
    let ServerFrame::NewMessage(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.sender.id, alice_id);
    assert_eq!(payload.unread_count, 1);
}

#[tokio::test]
async fn presence_refcount_emits_one_online_and_one_offline() {
    let server = start_test_server().await;
    let [alice_id, ..] = server.user_ids;

    let (_write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;

    let presence_for_alice = |status: UserStatus| {
        move |e: &Envelope| {
            matches!(e.frame, ServerFrame::PresenceUpdate(p)
                if p.user_id == alice_id && p.status == status)
        }
    };
    let any_presence_for_alice = |e: &Envelope| {
        matches!(e.frame, ServerFrame::PresenceUpdate(p) if p.user_id == alice_id)
    };

    // First socket: one online transition.
    let (mut write_s1, read_s1) = connect_ws(&server.addr, "tok-alice").await;
    recv_until(&mut read_b, presence_for_alice(UserStatus::Online)).await;

    // Second socket: no transition.
    let (mut write_s2, read_s2) = connect_ws(&server.addr, "tok-alice").await;
    assert_quiet(&mut read_b, any_presence_for_alice).await;

    // One of two sockets closes: still online.
    drop(read_s1);
    write_s1.close().await.unwrap();
    assert_quiet(&mut read_b, any_presence_for_alice).await;

    // Last socket closes: exactly one offline.
    drop(read_s2);
    write_s2.close().await.unwrap();
    recv_until(&mut read_b, presence_for_alice(UserStatus::Offline)).await;
    assert_quiet(&mut read_b, any_presence_for_alice).await;
}

#[tokio::test]
async fn reconnect_backfill_returns_missed_messages_in_order() {
    let server = start_test_server().await;

    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    join_room(&mut write_b, &mut read_b, 7).await;

    let mut ids = Vec::new();
    for content in ["before", "missed-1", "missed-2", "missed-3"] {
        send_json(
            &mut write_b,
            serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": content}}),
        )
        .await;
        let envelope = recv_until(&mut read_b, is_new_message).await;
        let ServerFrame::NewMessage(payload) = envelope.frame else {
            unreachable!()
        };
        ids.push(payload.id);
    }

    // Alice was offline the whole time and reconciles over REST.
    let rows: Vec<StoredChatMessage> = reqwest::Client::new()
        .get(format!(
            "http://{}/rooms/7/messages?after_id={}&limit=50&token=tok-alice",
            server.addr, ids[0]
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let got: Vec<u64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(got, ids[1..].to_vec());
    assert!(rows.iter().all(|r| !r.is_deleted));
    assert_eq!(rows[0].content, "missed-1");
    assert_eq!(rows[2].content, "missed-3");
}

#[tokio::test]
async fn backfill_renders_deleted_messages_as_tombstones() {
    let server = start_test_server().await;

    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    join_room(&mut write_b, &mut read_b, 7).await;

    let mut ids = Vec::new();
    for content in ["kept", "removed"] {
        send_json(
            &mut write_b,
            serde_json::json!({"type": "send_message", "payload": {"room_id": 7, "content": content}}),
        )
        .await;
        let envelope = recv_until(&mut read_b, is_new_message).await;
        let ServerFrame::NewMessage(payload) = envelope.frame else {
            unreachable!()
        };
        ids.push(payload.id);
    }
    server.store.mark_deleted(ids[1]).await;

    let rows: Vec<StoredChatMessage> = reqwest::Client::new()
        .get(format!(
            "http://{}/rooms/7/messages?after_id=0&token=tok-bob",
            server.addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].content, "kept");
    assert!(rows[1].is_deleted);
    assert_eq!(
        rows[1].content,
        roomcast::repo::memory::DELETED_MESSAGE_TOMBSTONE
    );
}

#[tokio::test]
async fn backfill_requires_membership() {
    let server = start_test_server().await;

    let status = reqwest::Client::new()
        .get(format!(
            "http://{}/rooms/7/messages?after_id=0&token=tok-dave",
            server.addr
        ))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn upgrade_without_valid_token_is_rejected() {
    let server = start_test_server().await;

    for url in [
        format!("ws://{}/ws", server.addr),
        format!("ws://{}/ws?token=bogus", server.addr),
    ] {
        let request = url.into_client_request().unwrap();
        let result = tokio_tungstenite::connect_async(request).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected 401 rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn user_joined_and_left_carry_member_counts() {
    let server = start_test_server().await;
    let [_, bob_id, ..] = server.user_ids;

    let (mut write_a, mut read_a) = connect_ws(&server.addr, "tok-alice").await;
    join_room(&mut write_a, &mut read_a, 7).await;

    let (mut write_b, mut read_b) = connect_ws(&server.addr, "tok-bob").await;
    join_room(&mut write_b, &mut read_b, 7).await;

    let envelope = recv_until(&mut read_a, |e| {
        matches!(&e.frame, ServerFrame::UserJoined(p) if p.user.id == bob_id)
    })
    .await;
    let ServerFrame::UserJoined(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.member_count, 3);

    send_json(
        &mut write_b,
        serde_json::json!({"type": "leave_room", "payload": {"room_id": 7}}),
    )
    .await;
    let envelope = recv_until(&mut read_a, |e| {
        matches!(&e.frame, ServerFrame::UserLeft(p) if p.user_id == bob_id)
    })
    .await;
    let ServerFrame::UserLeft(payload) = envelope.frame else {
        unreachable!()
    };
    assert_eq!(payload.room_id, 7);
}
