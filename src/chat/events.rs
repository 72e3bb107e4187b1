// Wire event taxonomy for the support chat protocol.
// Frames are JSON text of the shape {"event": "<name>", "data": {...}}.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::{ChatMessage, ConnectionState, DeliveryState, MessageKind};

/// Event names, client -> server.
pub mod outbound {
    pub const AUTH: &str = "auth";
    pub const JOIN: &str = "conversation:join";
    pub const MESSAGE_SEND: &str = "message:send";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";
    pub const MESSAGE_SEEN: &str = "message:seen";
}

/// Event names, server -> client.
pub mod inbound {
    pub const AUTH_OK: &str = "auth:ok";
    pub const AUTH_ERROR: &str = "auth:error";
    pub const MESSAGE_RECEIVE: &str = "message:receive";
    pub const TYPING_UPDATE: &str = "typing:update";
    pub const PRESENCE_ADMIN: &str = "presence:admin_status";
    pub const MESSAGE_SEEN_ACK: &str = "message:seen_ack";
    pub const ERROR: &str = "error";
}

/// The kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionState,
    Message,
    Typing,
    Presence,
    SeenAck,
    Error,
}

/// Events fanned out to subscribers by the connection manager.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConnectionState(ConnectionState),
    Message(ChatMessage),
    Typing { user_id: String, is_typing: bool },
    Presence { is_online: bool },
    SeenAck {
        message_id: String,
        seen_at: DateTime<Utc>,
        is_read: bool,
    },
    Error { message: String },
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::ConnectionState(_) => EventKind::ConnectionState,
            ChatEvent::Message(_) => EventKind::Message,
            ChatEvent::Typing { .. } => EventKind::Typing,
            ChatEvent::Presence { .. } => EventKind::Presence,
            ChatEvent::SeenAck { .. } => EventKind::SeenAck,
            ChatEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Client -> server frames.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Auth { token: String },
    Join { conversation_key: String },
    MessageSend {
        id: String,
        content: String,
        kind: MessageKind,
        recipient: String,
    },
    TypingStart { recipient: String },
    TypingStop { recipient: String },
    MessageSeen { message_id: String },
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        let frame = match self {
            ClientFrame::Auth { token } => json!({
                "event": outbound::AUTH,
                "data": { "token": token },
            }),
            ClientFrame::Join { conversation_key } => json!({
                "event": outbound::JOIN,
                "data": { "conversationKey": conversation_key },
            }),
            ClientFrame::MessageSend { id, content, kind, recipient } => json!({
                "event": outbound::MESSAGE_SEND,
                "data": { "id": id, "content": content, "kind": kind, "recipient": recipient },
            }),
            ClientFrame::TypingStart { recipient } => json!({
                "event": outbound::TYPING_START,
                "data": { "recipient": recipient },
            }),
            ClientFrame::TypingStop { recipient } => json!({
                "event": outbound::TYPING_STOP,
                "data": { "recipient": recipient },
            }),
            ClientFrame::MessageSeen { message_id } => json!({
                "event": outbound::MESSAGE_SEEN,
                "data": { "messageId": message_id },
            }),
        };
        frame.to_string()
    }
}

/// Server -> client frames after parsing. Auth replies are consumed during
/// the handshake; the rest are fanned out as [`ChatEvent`]s.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    AuthOk { user_id: String },
    AuthError { message: String },
    Message(ChatMessage),
    Typing { user_id: String, is_typing: bool },
    Presence { is_online: bool },
    SeenAck {
        message_id: String,
        seen_at: DateTime<Utc>,
        is_read: bool,
    },
    AppError { message: String },
}

#[derive(Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthOkData {
    user_id: String,
}

#[derive(Deserialize)]
struct ErrorData {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageReceiveData {
    id: String,
    content: String,
    #[serde(default)]
    kind: MessageKind,
    sender: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_read: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingUpdateData {
    user_id: String,
    is_typing: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceData {
    is_online: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeenAckData {
    message_id: String,
    seen_at: DateTime<Utc>,
    is_read: bool,
}

/// Parse one inbound text frame. A malformed frame (bad JSON, unknown event,
/// missing required field) is logged and dropped; it must never take the
/// event loop down.
pub fn parse_server_frame(text: &str) -> Option<ServerEvent> {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping unparseable frame: {}", e);
            return None;
        }
    };

    let result = match frame.event.as_str() {
        inbound::AUTH_OK => serde_json::from_value::<AuthOkData>(frame.data)
            .map(|d| ServerEvent::AuthOk { user_id: d.user_id }),
        inbound::AUTH_ERROR => serde_json::from_value::<ErrorData>(frame.data)
            .map(|d| ServerEvent::AuthError { message: d.message }),
        inbound::MESSAGE_RECEIVE => {
            serde_json::from_value::<MessageReceiveData>(frame.data).map(|d| {
                ServerEvent::Message(ChatMessage {
                    id: d.id,
                    // The conversation key is filled in by the channel that
                    // consumes the event.
                    conversation: String::new(),
                    sender: d.sender,
                    content: d.content,
                    kind: d.kind,
                    created_at: d.created_at,
                    seen_at: d.seen_at,
                    is_read: d.is_read,
                    delivery: DeliveryState::Confirmed,
                })
            })
        }
        inbound::TYPING_UPDATE => serde_json::from_value::<TypingUpdateData>(frame.data)
            .map(|d| ServerEvent::Typing {
                user_id: d.user_id,
                is_typing: d.is_typing,
            }),
        inbound::PRESENCE_ADMIN => serde_json::from_value::<PresenceData>(frame.data)
            .map(|d| ServerEvent::Presence { is_online: d.is_online }),
        inbound::MESSAGE_SEEN_ACK => serde_json::from_value::<SeenAckData>(frame.data)
            .map(|d| ServerEvent::SeenAck {
                message_id: d.message_id,
                seen_at: d.seen_at,
                is_read: d.is_read,
            }),
        inbound::ERROR => serde_json::from_value::<ErrorData>(frame.data)
            .map(|d| ServerEvent::AppError { message: d.message }),
        other => {
            warn!("Dropping frame with unknown event '{}'", other);
            return None;
        }
    };

    match result {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Dropping malformed '{}' frame: {}", frame.event, e);
            None
        }
    }
}
