// Per-conversation message state: ordered, deduplicated, merged from the
// history side channel and the live event stream. Handles optimistic send
// with pending -> confirmed reconciliation against the server echo.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ChatMessage, ConnectionState, DeliveryState, MessageKind};

use super::connection::{ConnectionError, ConnectionManager, Subscription};
use super::events::{ChatEvent, ClientFrame, EventKind};
use super::history::HistoryApi;

/// Window within which a server echo without our client id is still matched
/// against a pending message by (sender, content, timestamp) fingerprint.
const ECHO_FINGERPRINT_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Send was attempted while offline. Not auto-retried; the caller may
    /// resubmit once reconnected.
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    /// Recoverable: live messages already received are kept; the caller may
    /// retry the fetch.
    #[error("history fetch failed: {0}")]
    History(String),
}

/// Deduplicated message state for one conversation, keyed by id.
#[derive(Default)]
pub struct MessageStore {
    by_id: HashMap<String, ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore::default()
    }

    pub fn insert_pending(&mut self, message: ChatMessage) {
        self.by_id.insert(message.id.clone(), message);
    }

    /// Merge a server-origin message. Replacement by id wins; otherwise a
    /// pending entry matching the echo fingerprint is reconciled in place.
    /// The list never ends up with two entries for one logical message.
    pub fn upsert_confirmed(&mut self, mut message: ChatMessage) {
        message.delivery = DeliveryState::Confirmed;

        if let Some(existing) = self.by_id.get(&message.id) {
            if message.conversation.is_empty() {
                message.conversation = existing.conversation.clone();
            }
            self.by_id.insert(message.id.clone(), message);
            return;
        }

        let fingerprint_match = self
            .by_id
            .values()
            .find(|m| {
                m.is_pending()
                    && m.sender == message.sender
                    && m.content == message.content
                    && (m.created_at - message.created_at).num_seconds().abs()
                        <= ECHO_FINGERPRINT_TOLERANCE_SECS
            })
            .map(|m| m.id.clone());
        if let Some(pending_id) = fingerprint_match {
            debug!(
                "Reconciling pending message {} with server id {}",
                pending_id, message.id
            );
            if let Some(pending) = self.by_id.remove(&pending_id) {
                if message.conversation.is_empty() {
                    message.conversation = pending.conversation;
                }
            }
        }

        self.by_id.insert(message.id.clone(), message);
    }

    pub fn apply_seen(
        &mut self,
        message_id: &str,
        seen_at: chrono::DateTime<Utc>,
        is_read: bool,
    ) -> bool {
        match self.by_id.get_mut(message_id) {
            Some(message) => {
                message.seen_at = Some(seen_at);
                message.is_read = is_read;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, message_id: &str) -> Option<&ChatMessage> {
        self.by_id.get(message_id)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<ChatMessage> {
        self.by_id.remove(message_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The consumable view: total order by creation time, ties by id.
    pub fn sorted(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self.by_id.values().cloned().collect();
        messages.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        messages
    }
}

struct ChannelInner {
    conn: ConnectionManager,
    api: Option<HistoryApi>,
    conversation_key: String,
    self_id: String,
    remote_id: String,
    store: Arc<Mutex<MessageStore>>,
    /// Set when the connection drops; a subsequent Connected triggers a full
    /// history re-fetch to close the event gap.
    resync_needed: AtomicBool,
}

impl ChannelInner {
    fn ingest(&self, mut message: ChatMessage) {
        if message.sender != self.self_id && message.sender != self.remote_id {
            debug!(
                "Dropping message {} from non-participant {}",
                message.id, message.sender
            );
            return;
        }
        if message.conversation.is_empty() {
            message.conversation = self.conversation_key.clone();
        }
        self.store.lock().unwrap().upsert_confirmed(message);
    }
}

pub struct MessageChannel {
    inner: Arc<ChannelInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MessageChannel {
    pub fn new(
        conn: ConnectionManager,
        api: Option<HistoryApi>,
        conversation_key: &str,
        self_id: &str,
        remote_id: &str,
    ) -> Self {
        MessageChannel {
            inner: Arc::new(ChannelInner {
                conn,
                api,
                conversation_key: conversation_key.to_string(),
                self_id: self_id.to_string(),
                remote_id: remote_id.to_string(),
                store: Arc::new(Mutex::new(MessageStore::new())),
                resync_needed: AtomicBool::new(false),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register the conversation with the connection (joined now and after
    /// every reconnect) and subscribe to inbound message and state events.
    pub fn join(&self) {
        self.inner.conn.register_join(&self.inner.conversation_key);

        let inner = self.inner.clone();
        let on_message = self.inner.conn.on(EventKind::Message, move |event| {
            if let ChatEvent::Message(message) = event {
                inner.ingest(message.clone());
            }
        });

        let inner = self.inner.clone();
        let on_state = self
            .inner
            .conn
            .on(EventKind::ConnectionState, move |event| {
                let state = match event {
                    ChatEvent::ConnectionState(state) => *state,
                    _ => return,
                };
                match state {
                    ConnectionState::Disconnected => {
                        inner.resync_needed.store(true, Ordering::SeqCst);
                    }
                    ConnectionState::Connected
                        if inner.resync_needed.swap(false, Ordering::SeqCst) =>
                    {
                        // Events may have been missed while disconnected;
                        // trusting only the live stream here would leave a
                        // gap, so the full history is re-fetched.
                        let api = match inner.api.clone() {
                            Some(api) => api,
                            None => {
                                debug!("No side-channel API; skipping history resync");
                                return;
                            }
                        };
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            match api.fetch_messages(&inner.remote_id).await {
                                Ok(messages) => {
                                    info!(
                                        "Resynced {} messages after reconnect",
                                        messages.len()
                                    );
                                    for message in messages {
                                        inner.ingest(message);
                                    }
                                }
                                Err(e) => warn!(
                                    "History resync failed: {}; keeping live messages",
                                    e
                                ),
                            }
                        });
                    }
                    _ => {}
                }
            });

        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(on_message);
        subscriptions.push(on_state);
    }

    /// Optimistic send. Fails immediately when offline: outgoing messages
    /// are never queued while disconnected, the caller resubmits instead.
    pub fn send(&self, content: &str, kind: MessageKind) -> Result<ChatMessage, ChatError> {
        if !self.inner.conn.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation: self.inner.conversation_key.clone(),
            sender: self.inner.self_id.clone(),
            content: content.to_string(),
            kind,
            created_at: Utc::now(),
            seen_at: None,
            is_read: false,
            delivery: DeliveryState::Pending,
        };

        // The pending entry must be in the store before the frame goes out:
        // the read loop runs on its own task, and an echo that beats
        // insert_pending would either duplicate the message or bury the
        // confirmation under a stale pending entry.
        self.inner
            .store
            .lock()
            .unwrap()
            .insert_pending(message.clone());

        let sent = self.inner.conn.send(ClientFrame::MessageSend {
            id: message.id.clone(),
            content: message.content.clone(),
            kind: message.kind,
            recipient: self.inner.remote_id.clone(),
        });
        if let Err(e) = sent {
            // Nothing went out, so nothing may stay queued.
            self.inner.store.lock().unwrap().remove(&message.id);
            return Err(match e {
                ConnectionError::NotConnected => ChatError::NotConnected,
                other => ChatError::Send(other.to_string()),
            });
        }
        Ok(message)
    }

    /// One-shot history fetch, merged with whatever live messages are
    /// already present.
    pub async fn load_history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        let api = self
            .inner
            .api
            .as_ref()
            .ok_or_else(|| ChatError::History("no side-channel API configured".to_string()))?;
        let messages = api.fetch_messages(&self.inner.remote_id).await?;
        self.merge_history(messages);
        Ok(self.messages())
    }

    /// Merge fetched history into the store by id-dedup.
    pub fn merge_history(&self, messages: Vec<ChatMessage>) {
        for message in messages {
            self.inner.ingest(message);
        }
    }

    /// Direct event intake, also used by the message subscription.
    pub fn ingest(&self, message: ChatMessage) {
        self.inner.ingest(message);
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.store.lock().unwrap().sorted()
    }

    /// Shared handle for the read-receipt tracker.
    pub fn store(&self) -> Arc<Mutex<MessageStore>> {
        self.inner.store.clone()
    }

    /// Release every subscription this channel registered.
    pub fn release(&self) {
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.inner.conn.off(sub);
        }
    }
}
