// Connection lifecycle tests: handshake, idempotent connect, fatal auth
// rejection, reconnect with backoff, explicit disconnect, and the
// subscriber registry.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use supportline::chat::{
    ChatEvent, ClientFrame, ConnectionError, ConnectionManager, EventKind, Transport,
    TransportSession,
};
use supportline::models::{ConnectionState, MessageKind};

use common::*;

/// Transport whose open() always fails, for exercising retry exhaustion.
struct FailingTransport {
    attempts: AtomicUsize,
}

#[async_trait]
impl Transport for FailingTransport {
    async fn open(&self, _url: &str) -> Result<TransportSession, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ConnectionError::Transport("refused".to_string()))
    }
}

#[tokio::test]
async fn test_connect_and_authenticate() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    conn.connect().await.expect("connect should succeed");
    assert!(conn.is_connected());
    assert_eq!(mock.opens(), 1);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_session() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    let (a, b) = tokio::join!(conn.connect(), conn.connect());
    a.expect("first connect");
    b.expect("second connect");

    assert!(conn.is_connected());
    assert_eq!(mock.opens(), 1, "only one transport session may be opened");
}

#[tokio::test]
async fn test_auth_rejection_is_fatal_and_not_retried() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(false));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    let err = conn.connect().await.expect_err("auth must be rejected");
    assert!(matches!(err, ConnectionError::AuthRejected(_)));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(mock.opens(), 1, "a rejected handshake must not be retried");
}

#[tokio::test]
async fn test_retries_exhausted_when_transport_never_opens() {
    setup_logging();
    let transport = Arc::new(FailingTransport {
        attempts: AtomicUsize::new(0),
    });
    let conn = ConnectionManager::new(test_config(), transport.clone());

    let err = conn.connect().await.expect_err("connect must give up");
    assert!(matches!(err, ConnectionError::RetriesExhausted(5)));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_reconnects_after_transport_drop() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());
    conn.register_join("admin-1:user-1");

    conn.connect().await.expect("connect");
    // The mock records sent frames on its own relay task; poll until it has
    // drained the join frame rather than asserting synchronously.
    assert!(
        wait_until(|| mock.count_sent("conversation:join") == 1, 1_000).await,
        "conversation must be joined on the initial session"
    );

    mock.kill();
    let recovered = wait_until(|| mock.opens() >= 2 && conn.is_connected(), 3_000).await;
    assert!(recovered, "connection should re-establish after a drop");
    assert!(
        wait_until(|| mock.count_sent("conversation:join") == 2, 1_000).await,
        "conversation must be re-joined on the new session"
    );
}

#[tokio::test]
async fn test_explicit_disconnect_stops_reconnect() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    conn.connect().await.expect("connect");
    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Idle);

    // The dead session must not trigger a reconnect cycle.
    mock.kill();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.opens(), 1);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_send_requires_connection() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock);

    let err = conn
        .send(ClientFrame::MessageSend {
            id: "m1".to_string(),
            content: "hello".to_string(),
            kind: MessageKind::Text,
            recipient: "admin-1".to_string(),
        })
        .expect_err("send while idle must fail");
    assert!(matches!(err, ConnectionError::NotConnected));
}

#[tokio::test]
async fn test_state_transitions_emitted_in_order() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock);

    let seen: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.on(EventKind::ConnectionState, move |event| {
        if let ChatEvent::ConnectionState(state) = event {
            sink.lock().unwrap().push(*state);
        }
    });

    conn.connect().await.expect("connect");
    let states = seen.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_break_dispatch() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    conn.on(EventKind::Error, |_| panic!("misbehaving subscriber"));
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = delivered.clone();
    conn.on(EventKind::Error, move |_| {
        flag.store(true, Ordering::SeqCst);
    });

    conn.connect().await.expect("connect");
    mock.inject(r#"{"event":"error","data":{"message":"boom"}}"#);

    let ok = wait_until(|| delivered.load(Ordering::SeqCst), 1_000).await;
    assert!(ok, "second subscriber must still receive the event");
    assert!(conn.is_connected(), "a subscriber panic must not drop the connection");
}

#[tokio::test]
async fn test_off_releases_subscription() {
    setup_logging();
    let mock = Arc::new(MockTransport::new(true));
    let conn = ConnectionManager::new(test_config(), mock.clone());

    let count = Arc::new(AtomicUsize::new(0));
    let sink = count.clone();
    let sub = conn.on(EventKind::Message, move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    conn.connect().await.expect("connect");
    mock.inject(&message_receive_frame("m1", "admin-1", "hi", 0));
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 1, 1_000).await);

    conn.off(sub);
    mock.inject(&message_receive_frame("m2", "admin-1", "hi again", 0));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "released handler must not fire");
}
