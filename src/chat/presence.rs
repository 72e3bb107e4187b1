// Presence tracking for the administrative counterpart.
// Two independent sources of truth: a one-shot status fetch used as a seed,
// and live push events which are authoritative once observed.

use chrono::Utc;
use log::debug;
use std::sync::{Arc, Mutex};

use crate::models::PresenceState;

use super::channel::ChatError;
use super::connection::{ConnectionManager, Subscription};
use super::events::{ChatEvent, EventKind};
use super::history::HistoryApi;

struct PresenceInner {
    state: Mutex<PresenceState>,
}

impl PresenceInner {
    fn apply_live(&self, is_online: bool) {
        let mut state = self.state.lock().unwrap();
        debug!("Admin presence changed: online={}", is_online);
        state.is_online = is_online;
        state.updated_at = Utc::now();
        state.live_seen = true;
    }
}

pub struct PresenceTracker {
    conn: ConnectionManager,
    inner: Arc<PresenceInner>,
    subscription: Mutex<Option<Subscription>>,
}

impl PresenceTracker {
    pub fn new(conn: ConnectionManager) -> Self {
        PresenceTracker {
            conn,
            inner: Arc::new(PresenceInner {
                state: Mutex::new(PresenceState::default()),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to live presence events.
    pub fn attach(&self) {
        let inner = self.inner.clone();
        let sub = self.conn.on(EventKind::Presence, move |event| {
            if let ChatEvent::Presence { is_online } = event {
                inner.apply_live(*is_online);
            }
        });
        *self.subscription.lock().unwrap() = Some(sub);
    }

    /// One-shot seed over the HTTP side channel, usable before or without
    /// the persistent connection.
    pub async fn fetch_initial(&self, api: &HistoryApi) -> Result<bool, ChatError> {
        let is_online = api.fetch_admin_status().await?;
        self.seed(is_online);
        Ok(is_online)
    }

    /// Apply a seeded value. A seed never overrides state once any live
    /// event has been observed, regardless of which source answered first.
    pub fn seed(&self, is_online: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if state.live_seen {
            debug!("Ignoring stale presence seed; live events already seen");
            return;
        }
        state.is_online = is_online;
        state.updated_at = Utc::now();
    }

    /// Live event intake, also used by the subscription.
    pub fn on_presence_changed(&self, is_online: bool) {
        self.inner.apply_live(is_online);
    }

    pub fn is_admin_online(&self) -> bool {
        self.inner.state.lock().unwrap().is_online
    }

    pub fn state(&self) -> PresenceState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn release(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            self.conn.off(sub);
        }
    }
}
