// Re-export needed modules for testing
pub mod chat;
pub mod config;
pub mod models;

// Re-export main types for convenience
pub use chat::ChatSession;
pub use config::ChatConfig;
pub use models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use chat::{conversation_key, MessageStore};
    use chrono::{TimeZone, Utc};

    fn message(id: &str, sender: &str, content: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation: "admin-1:user-1".to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            seen_at: None,
            is_read: false,
            delivery: DeliveryState::Confirmed,
        }
    }

    #[test]
    fn test_conversation_key_is_order_independent() {
        assert_eq!(
            conversation_key("user-1", "admin-1"),
            conversation_key("admin-1", "user-1")
        );
        assert_eq!(conversation_key("admin-1", "user-1"), "admin-1:user-1");
    }

    #[test]
    fn test_message_ordering_by_timestamp_then_id() {
        let mut store = MessageStore::new();
        store.upsert_confirmed(message("b", "user-1", "second", 10));
        store.upsert_confirmed(message("a", "user-1", "tie-first", 5));
        store.upsert_confirmed(message("c", "user-1", "tie-second", 5));

        let sorted = store.sorted();
        let ids: Vec<&str> = sorted.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_store_dedups_by_id() {
        let mut store = MessageStore::new();
        store.upsert_confirmed(message("m1", "admin-1", "hello", 0));
        store.upsert_confirmed(message("m1", "admin-1", "hello", 0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_insert_and_remove() {
        let mut store = MessageStore::new();
        assert!(store.is_empty());

        let mut pending = message("local-1", "user-1", "hello", 0);
        pending.delivery = DeliveryState::Pending;
        store.insert_pending(pending);
        assert!(!store.is_empty());

        // A failed send rolls its pending entry back out.
        assert!(store.remove("local-1").is_some());
        assert!(store.is_empty());
        assert!(store.remove("local-1").is_none());
    }

    #[test]
    fn test_pending_reconciled_by_fingerprint() {
        let mut store = MessageStore::new();
        let mut pending = message("local-uuid", "user-1", "hello", 0);
        pending.delivery = DeliveryState::Pending;
        store.insert_pending(pending);

        // Server assigned its own id but the fingerprint matches
        let echo = message("server-77", "user-1", "hello", 2);
        store.upsert_confirmed(echo);

        assert_eq!(store.len(), 1);
        let only = &store.sorted()[0];
        assert_eq!(only.id, "server-77");
        assert_eq!(only.delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn test_unrelated_pending_not_reconciled() {
        let mut store = MessageStore::new();
        let mut pending = message("local-uuid", "user-1", "hello", 0);
        pending.delivery = DeliveryState::Pending;
        store.insert_pending(pending);

        // Same sender, different content: a different message entirely
        store.upsert_confirmed(message("server-78", "user-1", "goodbye", 1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_apply_seen_updates_message() {
        let mut store = MessageStore::new();
        store.upsert_confirmed(message("m1", "user-1", "hello", 0));

        let seen_at = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert!(store.apply_seen("m1", seen_at, true));
        let msg = store.get("m1").expect("message present");
        assert_eq!(msg.seen_at, Some(seen_at));
        assert!(msg.is_read);

        assert!(!store.apply_seen("missing", seen_at, true));
    }
}
