//! End-to-end tests: real relay, real WebSocket sessions.

use serde_json::json;
use std::time::Duration;
use tandem_collab::channel::{ChannelError, ChannelState};
use tandem_collab::protocol::Cursor;
use tandem_collab::relay::{RelayConfig, RelayServer};
use tandem_collab::session::{SessionConfig, SessionError, SessionEvent, SyncSession};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Start a relay on a free port and return its URL.
async fn start_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(RelayConfig {
        broadcast_capacity: 64,
        ..RelayConfig::default()
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

fn session(user_id: &str, username: &str) -> SyncSession {
    let config = SessionConfig {
        reconnect_interval_ms: 50,
        max_reconnect_attempts: 2,
        ..SessionConfig::default()
    }
    .with_user_id(user_id)
    .with_username(username);
    SyncSession::new(config).unwrap()
}

fn subscribe(session: &SyncSession, event: &str) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.events().on(event, move |evt| {
        let _ = tx.send(evt.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within timeout")
        .expect("bus still alive")
}

/// Connect and wait for the relay's roster, so the relay has registered us.
async fn join(session: &SyncSession, url: &str, room: &str) {
    let mut synced = subscribe(session, SessionEvent::PRESENCE_SYNCED);
    session.connect(url, room, "").await.unwrap();
    next_event(&mut synced).await;
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let ok = timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_peers_see_each_other_join() {
    let url = start_relay().await;

    let alice = session("alice", "Alice");
    let mut alice_joins = subscribe(&alice, SessionEvent::USER_JOINED);
    join(&alice, &url, "design").await;
    assert_eq!(alice.connection_state(), ChannelState::Open);

    // Let the relay fold in Alice's profile before Bob arrives.
    sleep(Duration::from_millis(50)).await;

    let bob = session("bob", "Bob");
    let mut bob_synced = subscribe(&bob, SessionEvent::PRESENCE_SYNCED);
    join(&bob, &url, "design").await;

    match next_event(&mut alice_joins).await {
        SessionEvent::UserJoined(p) => {
            assert_eq!(p.user_id, "bob");
            assert_eq!(p.username, "Bob");
        }
        other => panic!("expected bob's join, got {other:?}"),
    }

    match next_event(&mut bob_synced).await {
        SessionEvent::PresenceSynced(users) => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user_id, "alice");
            assert_eq!(users[0].username, "Alice");
        }
        other => panic!("expected roster, got {other:?}"),
    }
    assert!(alice.get_presence().iter().all(|p| p.user_id != "alice"));
}

#[tokio::test]
async fn test_cursor_reaches_peer_without_self_echo() {
    let url = start_relay().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    let mut alice_cursors = subscribe(&alice, SessionEvent::CURSOR_MOVED);
    let mut bob_cursors = subscribe(&bob, SessionEvent::CURSOR_MOVED);
    join(&alice, &url, "design").await;
    join(&bob, &url, "design").await;

    assert!(alice.update_cursor(10.0, 20.0));

    assert_eq!(
        next_event(&mut bob_cursors).await,
        SessionEvent::CursorMoved {
            user_id: "alice".into(),
            cursor: Cursor::new(10.0, 20.0),
        }
    );
    let alice_seen_by_bob = bob
        .get_presence()
        .into_iter()
        .find(|p| p.user_id == "alice")
        .unwrap();
    assert_eq!(alice_seen_by_bob.cursor, Some(Cursor::new(10.0, 20.0)));

    sleep(Duration::from_millis(100)).await;
    assert!(alice_cursors.try_recv().is_err(), "own cursor must not echo");
}

#[tokio::test]
async fn test_state_converges_across_sessions() {
    let url = start_relay().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    let mut bob_updates = subscribe(&bob, SessionEvent::STATE_UPDATED);
    let mut alice_updates = subscribe(&alice, SessionEvent::STATE_UPDATED);
    join(&alice, &url, "design").await;
    join(&bob, &url, "design").await;

    alice.set("title", json!("Hello"));
    match next_event(&mut bob_updates).await {
        SessionEvent::StateUpdated(snapshot) => {
            assert_eq!(snapshot.version, 1);
            assert_eq!(snapshot.state["title"], json!("Hello"));
            assert_eq!(snapshot.vector_clock["alice"], 1);
        }
        other => panic!("expected state update, got {other:?}"),
    }
    assert_eq!(bob.get_state()["title"], json!("Hello"));

    let mut partial = tandem_collab::protocol::Document::new();
    partial.insert("title".into(), json!("Hello, world"));
    partial.insert("zoom".into(), json!(2));
    bob.update_state(partial);

    next_event(&mut alice_updates).await;
    assert_eq!(alice.get_version(), 3);
    assert_eq!(alice.get_state(), bob.get_state());
    assert_eq!(alice.state_snapshot().vector_clock["bob"], 2);
    assert_eq!(alice.state_snapshot().vector_clock["alice"], 1);
}

#[tokio::test]
async fn test_disconnect_announces_departure() {
    let url = start_relay().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    let mut alice_leaves = subscribe(&alice, SessionEvent::USER_LEFT);
    join(&alice, &url, "design").await;
    join(&bob, &url, "design").await;
    eventually("alice to see bob", || {
        alice.get_presence().iter().any(|p| p.user_id == "bob")
    })
    .await;

    bob.disconnect();
    assert_eq!(bob.connection_state(), ChannelState::Closed);

    assert_eq!(
        next_event(&mut alice_leaves).await,
        SessionEvent::UserLeft { user_id: "bob".into() }
    );
    assert!(alice.get_presence().is_empty());

    // Relay does not repeat the goodbye when the socket closes.
    sleep(Duration::from_millis(100)).await;
    assert!(alice_leaves.try_recv().is_err());
}

#[tokio::test]
async fn test_late_joiner_receives_full_roster() {
    let url = start_relay().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    join(&alice, &url, "design").await;
    join(&bob, &url, "design").await;
    eventually("bob to see alice", || bob.get_presence().len() == 1).await;

    let carol = session("carol", "Carol");
    let mut carol_synced = subscribe(&carol, SessionEvent::PRESENCE_SYNCED);
    join(&carol, &url, "design").await;

    match next_event(&mut carol_synced).await {
        SessionEvent::PresenceSynced(users) => {
            let ids: Vec<_> = users.iter().map(|p| p.user_id.as_str()).collect();
            assert_eq!(ids, vec!["alice", "bob"]);
        }
        other => panic!("expected roster, got {other:?}"),
    }
    eventually("alice to see carol", || alice.get_presence().len() == 2).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_relay().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    let mut bob_cursors = subscribe(&bob, SessionEvent::CURSOR_MOVED);
    join(&alice, &url, "design").await;
    join(&bob, &url, "notes").await;

    alice.update_cursor(1.0, 1.0);
    sleep(Duration::from_millis(100)).await;
    assert!(bob_cursors.try_recv().is_err());
    assert!(bob.get_presence().is_empty());
}

#[tokio::test]
async fn test_connect_to_closed_port_fails_without_retry() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let alice = session("alice", "Alice");
    let mut changes = subscribe(&alice, SessionEvent::CONNECTION_CHANGED);
    let result = alice.connect(&format!("ws://127.0.0.1:{port}"), "design", "").await;

    assert!(matches!(
        result,
        Err(SessionError::Channel(ChannelError::Open { .. }))
    ));
    assert_eq!(alice.connection_state(), ChannelState::Closed);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(alice.connection_state(), ChannelState::Closed);
    assert!(matches!(
        next_event(&mut changes).await,
        SessionEvent::ConnectionChanged(ChannelState::Connecting)
    ));
    assert!(matches!(
        next_event(&mut changes).await,
        SessionEvent::ConnectionChanged(ChannelState::Closed)
    ));
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_after_relay_stops_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::with_defaults();
    let relay = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let alice = session("alice", "Alice");
    alice.connect(&format!("ws://{addr}"), "design", "").await.unwrap();

    // Aborting the accept loop drops the listener.
    relay.abort();
    sleep(Duration::from_millis(50)).await;
    let err = alice.reconnect().await;
    assert!(err.is_err());
    assert_eq!(alice.connection_state(), ChannelState::Closed);
}
