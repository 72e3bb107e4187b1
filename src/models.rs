// Core data model for the support chat client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a message carries. The core only transports the payload reference;
/// rendering and upload of non-text kinds happen elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Image,
    Location,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Two-phase state of an optimistically sent message.
/// A client-origin message starts as Pending and becomes Confirmed when the
/// server echo for the same id (or fingerprint) arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub conversation: String,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(skip, default = "confirmed")]
    pub delivery: DeliveryState,
}

fn confirmed() -> DeliveryState {
    DeliveryState::Confirmed
}

impl ChatMessage {
    /// Total order within a conversation: creation time, ties broken by id.
    pub fn ordering_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

/// Connection lifecycle. Monotonic except for the
/// Connected <-> Disconnected <-> Reconnecting cycle; Failed is reached after
/// a fatal auth rejection or after the bounded retry policy is exhausted, and
/// is left only by an explicit connect().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Online/offline status of the administrative counterpart.
///
/// `live_seen` latches once a push event has been observed so that a slow
/// initial status fetch can never revert authoritative live state.
#[derive(Debug, Clone)]
pub struct PresenceState {
    pub is_online: bool,
    pub updated_at: DateTime<Utc>,
    pub live_seen: bool,
}

impl Default for PresenceState {
    fn default() -> Self {
        PresenceState {
            is_online: false,
            updated_at: Utc::now(),
            live_seen: false,
        }
    }
}
