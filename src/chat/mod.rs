// Support chat core.
// This module is the entry point for the connection and event-coordination
// machinery: one connection manager shared by every component, a message
// channel per conversation, and the presence/typing/receipt trackers.

use log::warn;
use std::sync::Arc;

use crate::config::ChatConfig;
use crate::models::MessageKind;

pub mod channel;
pub mod connection;
pub mod events;
pub mod history;
pub mod presence;
pub mod receipts;
pub mod transport;
pub mod typing;

pub use channel::{ChatError, MessageChannel, MessageStore};
pub use connection::{ConnectionError, ConnectionManager, Subscription};
pub use events::{ChatEvent, ClientFrame, EventKind};
pub use history::HistoryApi;
pub use presence::PresenceTracker;
pub use receipts::ReadReceiptTracker;
pub use transport::{Transport, TransportSession, WsTransport};
pub use typing::TypingCoordinator;

/// Stable key for the pairing of a user and the administrative counterpart,
/// identical regardless of which side derives it.
pub fn conversation_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// Top-level aggregate owning one of each component. The application session
/// (not any individual UI mount) controls its lifecycle: `start` once after
/// login, `shutdown` once at logout.
pub struct ChatSession {
    pub connection: ConnectionManager,
    pub channel: MessageChannel,
    pub presence: PresenceTracker,
    pub typing: TypingCoordinator,
    pub receipts: ReadReceiptTracker,
    api: HistoryApi,
}

impl ChatSession {
    pub fn new(config: ChatConfig, transport: Arc<dyn Transport>) -> Self {
        let api = HistoryApi::new(&config.api_url, &config.token);
        let key = conversation_key(&config.user_id, &config.admin_id);

        let connection = ConnectionManager::new(config.clone(), transport);
        let channel = MessageChannel::new(
            connection.clone(),
            Some(api.clone()),
            &key,
            &config.user_id,
            &config.admin_id,
        );
        let presence = PresenceTracker::new(connection.clone());
        let typing =
            TypingCoordinator::new(connection.clone(), &config.admin_id, config.typing_window());
        let receipts = ReadReceiptTracker::new(connection.clone(), channel.store());

        ChatSession {
            connection,
            channel,
            presence,
            typing,
            receipts,
            api,
        }
    }

    /// Attach all subscriptions, connect, and seed presence and history.
    /// Seed failures are recoverable and do not abort the session.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.presence.attach();
        self.typing.attach();
        self.receipts.attach();
        self.channel.join();

        self.connection.connect().await?;

        if let Err(e) = self.presence.fetch_initial(&self.api).await {
            warn!("Presence seed failed: {}", e);
        }
        if let Err(e) = self.channel.load_history().await {
            warn!("Initial history load failed: {}", e);
        }
        Ok(())
    }

    /// Convenience for the common text case; also stops the local typing
    /// indicator, matching the send-implies-stop contract.
    pub fn send_text(&self, content: &str) -> Result<crate::models::ChatMessage, ChatError> {
        self.typing.notify_sent();
        self.channel.send(content, MessageKind::Text)
    }

    /// Release every subscription and tear the connection down.
    pub fn shutdown(&self) {
        self.channel.release();
        self.presence.release();
        self.typing.release();
        self.receipts.release();
        self.connection.disconnect();
    }
}
