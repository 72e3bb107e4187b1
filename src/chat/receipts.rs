// Read receipts: marking messages seen and reflecting seen acks back into
// the local message list.

use chrono::Utc;
use log::debug;
use std::sync::{Arc, Mutex};

use super::channel::{ChatError, MessageStore};
use super::connection::{ConnectionError, ConnectionManager, Subscription};
use super::events::{ChatEvent, ClientFrame, EventKind};

pub struct ReadReceiptTracker {
    conn: ConnectionManager,
    store: Arc<Mutex<MessageStore>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ReadReceiptTracker {
    pub fn new(conn: ConnectionManager, store: Arc<Mutex<MessageStore>>) -> Self {
        ReadReceiptTracker {
            conn,
            store,
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to seen acks so the sender's own list stays correct after
    /// reconnects and history reloads.
    pub fn attach(&self) {
        let store = self.store.clone();
        let sub = self.conn.on(EventKind::SeenAck, move |event| {
            if let ChatEvent::SeenAck {
                message_id,
                seen_at,
                is_read,
            } = event
            {
                let updated = store
                    .lock()
                    .unwrap()
                    .apply_seen(message_id, *seen_at, *is_read);
                if !updated {
                    debug!("Seen ack for unknown message {}", message_id);
                }
            }
        });
        *self.subscription.lock().unwrap() = Some(sub);
    }

    /// Mark a message as seen. Idempotent: an already-seen message is a
    /// no-op, and so is an id the store has never held; a receipt only goes
    /// out for a message the client actually displays. The local entry is
    /// updated optimistically; the seen_ack echo overwrites it with the
    /// authoritative timestamp.
    pub fn mark_seen(&self, message_id: &str) -> Result<(), ChatError> {
        {
            let store = self.store.lock().unwrap();
            match store.get(message_id) {
                None => {
                    debug!("Ignoring mark_seen for unknown message {}", message_id);
                    return Ok(());
                }
                Some(message) if message.seen_at.is_some() => {
                    debug!("Message {} already seen; nothing to do", message_id);
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        self.conn
            .send(ClientFrame::MessageSeen {
                message_id: message_id.to_string(),
            })
            .map_err(|e| match e {
                ConnectionError::NotConnected => ChatError::NotConnected,
                other => ChatError::Send(other.to_string()),
            })?;

        self.store
            .lock()
            .unwrap()
            .apply_seen(message_id, Utc::now(), false);
        Ok(())
    }

    /// Ack intake, also used by the subscription.
    pub fn on_seen_update(
        &self,
        message_id: &str,
        seen_at: chrono::DateTime<Utc>,
        is_read: bool,
    ) {
        self.store
            .lock()
            .unwrap()
            .apply_seen(message_id, seen_at, is_read);
    }

    pub fn release(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            self.conn.off(sub);
        }
    }
}
