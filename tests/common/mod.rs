// Common test utilities: an in-memory transport standing in for the
// WebSocket server, plus frame builders and polling helpers.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use supportline::chat::{ConnectionError, Transport, TransportSession};
use supportline::config::ChatConfig;
use supportline::models::{ChatMessage, DeliveryState, MessageKind};

pub fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with short timings so reconnect/backoff tests stay fast.
pub fn test_config() -> ChatConfig {
    let mut config = ChatConfig::new(
        "ws://localhost:0/ws",
        // Nothing listens here; history fetches fail fast and recoverably.
        "http://127.0.0.1:9",
        "test-token",
        "user-1",
        "admin-1",
    );
    config.reconnect_base_ms = 50;
    config.reconnect_max_ms = 200;
    config.max_reconnect_attempts = 5;
    config.auth_timeout_ms = 1_000;
    config.typing_window_ms = 100;
    config
}

struct MockState {
    accept_auth: bool,
    opens: usize,
    sent: Vec<String>,
    current: Option<mpsc::Sender<String>>,
}

/// Scripted server side of the transport seam. Replies to the auth frame,
/// records every other outbound frame, and lets tests inject inbound frames
/// or kill the session to simulate a network drop.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(accept_auth: bool) -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                accept_auth,
                opens: 0,
                sent: Vec::new(),
                current: None,
            })),
        }
    }

    /// Number of transport sessions opened so far.
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Frames the client sent after the handshake.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    /// How many sent frames carry the given event name.
    pub fn count_sent(&self, event: &str) -> usize {
        self.sent()
            .iter()
            .filter(|frame| {
                serde_json::from_str::<serde_json::Value>(frame)
                    .map(|v| v["event"] == event)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Push a frame to the client as if the server sent it.
    pub fn inject(&self, frame: &str) {
        let tx = self.state.lock().unwrap().current.clone();
        if let Some(tx) = tx {
            tx.try_send(frame.to_string()).expect("inject failed");
        }
    }

    /// Drop the server side of the current session, simulating an
    /// unexpected network drop.
    pub fn kill(&self) {
        self.state.lock().unwrap().current = None;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<TransportSession, ConnectionError> {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (in_tx, in_rx) = mpsc::channel::<String>(100);

        let state = self.state.clone();
        {
            let mut st = state.lock().unwrap();
            st.opens += 1;
            st.current = Some(in_tx.clone());
        }

        tokio::spawn(async move {
            // Holds the inbound sender only until the handshake is answered;
            // afterwards the session stays open exactly as long as the
            // test-held `current` sender lives.
            let mut handshake_tx = Some(in_tx);
            while let Some(frame) = out_rx.recv().await {
                let value: serde_json::Value =
                    serde_json::from_str(&frame).unwrap_or_default();
                if value["event"] == "auth" {
                    let accept = state.lock().unwrap().accept_auth;
                    let reply = if accept {
                        json!({"event": "auth:ok", "data": {"userId": "user-1"}})
                    } else {
                        json!({"event": "auth:error", "data": {"message": "bad token"}})
                    };
                    if let Some(tx) = handshake_tx.take() {
                        let _ = tx.send(reply.to_string()).await;
                    }
                } else {
                    state.lock().unwrap().sent.push(frame);
                }
            }
        });

        Ok(TransportSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Poll until the condition holds or the timeout lapses.
pub async fn wait_until<F>(cond: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn message_receive_frame(id: &str, sender: &str, content: &str, offset_secs: i64) -> String {
    let created_at = Utc::now() + ChronoDuration::seconds(offset_secs);
    json!({
        "event": "message:receive",
        "data": {
            "id": id,
            "content": content,
            "kind": "text",
            "sender": sender,
            "createdAt": created_at.to_rfc3339(),
        }
    })
    .to_string()
}

pub fn typing_update_frame(user_id: &str, is_typing: bool) -> String {
    json!({
        "event": "typing:update",
        "data": {"userId": user_id, "isTyping": is_typing}
    })
    .to_string()
}

pub fn presence_frame(is_online: bool) -> String {
    json!({
        "event": "presence:admin_status",
        "data": {"isOnline": is_online}
    })
    .to_string()
}

pub fn seen_ack_frame(message_id: &str, is_read: bool) -> String {
    json!({
        "event": "message:seen_ack",
        "data": {
            "messageId": message_id,
            "seenAt": Utc::now().to_rfc3339(),
            "isRead": is_read,
        }
    })
    .to_string()
}

/// A server-origin message as the history endpoint would return it.
pub fn history_message(id: &str, sender: &str, content: &str, offset_secs: i64) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        conversation: String::new(),
        sender: sender.to_string(),
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: Utc::now() + ChronoDuration::seconds(offset_secs),
        seen_at: None,
        is_read: false,
        delivery: DeliveryState::Confirmed,
    }
}
