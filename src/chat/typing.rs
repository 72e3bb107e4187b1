// Typing-indicator coordination.
// Local side: debounced start/stop emission driven by keystroke activity.
// Remote side: expiry of typing flags so a lost stop event cannot leave a
// counterpart "typing" forever.

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::{ConnectionManager, Subscription};
use super::events::{ChatEvent, ClientFrame, EventKind};

struct LocalTyping {
    active: bool,
    deadline: Instant,
    watcher: Option<JoinHandle<()>>,
}

struct RemoteEntry {
    epoch: u64,
    watcher: JoinHandle<()>,
}

struct TypingInner {
    conn: ConnectionManager,
    recipient: String,
    window: Duration,
    local: Mutex<LocalTyping>,
    remote: Mutex<HashMap<String, RemoteEntry>>,
    /// Distinguishes a refreshed remote entry from the expiry of its
    /// predecessor, so a stale timer never clears a fresh flag.
    epoch: AtomicU64,
}

impl TypingInner {
    fn send_frame(&self, frame: ClientFrame) {
        // Typing notifications are fire-and-observe; a failed send while
        // offline is not an error worth surfacing.
        if let Err(e) = self.conn.send(frame) {
            debug!("Skipping typing notification: {}", e);
        }
    }
}

pub struct TypingCoordinator {
    inner: Arc<TypingInner>,
    subscription: Mutex<Option<Subscription>>,
}

impl TypingCoordinator {
    pub fn new(conn: ConnectionManager, recipient: &str, window: Duration) -> Self {
        TypingCoordinator {
            inner: Arc::new(TypingInner {
                conn,
                recipient: recipient.to_string(),
                window,
                local: Mutex::new(LocalTyping {
                    active: false,
                    deadline: Instant::now(),
                    watcher: None,
                }),
                remote: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to remote typing updates.
    pub fn attach(&self) {
        let inner = self.inner.clone();
        let sub = self.inner.conn.on(EventKind::Typing, move |event| {
            if let ChatEvent::Typing { user_id, is_typing } = event {
                set_remote(&inner, user_id, *is_typing);
            }
        });
        *self.subscription.lock().unwrap() = Some(sub);
    }

    /// Keystroke intake. The first keystroke after an idle period emits
    /// typing:start immediately; further keystrokes only push the deadline.
    /// When the window lapses with no activity, typing:stop is emitted
    /// exactly once by the watcher task.
    pub fn on_local_activity(&self) {
        let mut local = self.inner.local.lock().unwrap();
        local.deadline = Instant::now() + self.inner.window;
        if local.active {
            return;
        }
        local.active = true;
        self.inner.send_frame(ClientFrame::TypingStart {
            recipient: self.inner.recipient.clone(),
        });

        let inner = self.inner.clone();
        local.watcher = Some(tokio::spawn(async move {
            loop {
                let deadline = inner.local.lock().unwrap().deadline;
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
            let lapsed = {
                let mut local = inner.local.lock().unwrap();
                if local.active {
                    local.active = false;
                    local.watcher = None;
                    true
                } else {
                    false
                }
            };
            if lapsed {
                inner.send_frame(ClientFrame::TypingStop {
                    recipient: inner.recipient.clone(),
                });
            }
        }));
    }

    /// Message was sent: stop typing immediately.
    pub fn notify_sent(&self) {
        self.stop_local();
    }

    /// Input lost focus: stop typing immediately.
    pub fn notify_blur(&self) {
        self.stop_local();
    }

    fn stop_local(&self) {
        let watcher = {
            let mut local = self.inner.local.lock().unwrap();
            if !local.active {
                return;
            }
            local.active = false;
            local.watcher.take()
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.inner.send_frame(ClientFrame::TypingStop {
            recipient: self.inner.recipient.clone(),
        });
    }

    /// Remote event intake, also used by the subscription.
    pub fn on_remote_typing(&self, user_id: &str, is_typing: bool) {
        set_remote(&self.inner, user_id, is_typing);
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.inner.remote.lock().unwrap().contains_key(user_id)
    }

    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.remote.lock().unwrap().keys().cloned().collect();
        users.sort();
        users
    }

    /// Cancel timers and release the subscription. Required on unmount so no
    /// late callback mutates released state.
    pub fn release(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            self.inner.conn.off(sub);
        }
        if let Some(watcher) = self.inner.local.lock().unwrap().watcher.take() {
            watcher.abort();
        }
        for (_, entry) in self.inner.remote.lock().unwrap().drain() {
            entry.watcher.abort();
        }
    }
}

/// Start sets the flag and (re)arms an expiry timer; expiry removes the
/// entry even without an explicit stop event. An explicit stop removes it
/// immediately.
fn set_remote(inner: &Arc<TypingInner>, user_id: &str, is_typing: bool) {
    let mut remote = inner.remote.lock().unwrap();

    if !is_typing {
        if let Some(entry) = remote.remove(user_id) {
            entry.watcher.abort();
        }
        return;
    }

    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let window = inner.window;
    let watcher_inner = inner.clone();
    let watcher_user = user_id.to_string();
    let watcher = tokio::spawn(async move {
        tokio::time::sleep(window).await;
        let mut remote = watcher_inner.remote.lock().unwrap();
        if remote.get(&watcher_user).map(|e| e.epoch) == Some(epoch) {
            debug!("Typing indicator for {} expired", watcher_user);
            remote.remove(&watcher_user);
        }
    });

    if let Some(old) = remote.insert(user_id.to_string(), RemoteEntry { epoch, watcher }) {
        old.watcher.abort();
    }
}
