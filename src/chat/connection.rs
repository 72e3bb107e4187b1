// Connection management for the support chat core.
// Owns the single transport session per client process: connect,
// authenticate, detect disconnect, reconnect with backoff, and fan inbound
// events out to subscribers.

use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use crate::config::ChatConfig;
use crate::models::ConnectionState;

use super::events::{parse_server_frame, ChatEvent, ClientFrame, EventKind, ServerEvent};
use super::transport::Transport;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Handshake rejection. Fatal: requires re-authentication upstream,
    /// never retried here.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Transient transport problem; retried by the reconnect cycle.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),
}

/// Opaque handle for a registered event subscriber. Whoever called `on` owns
/// the handle and is responsible for releasing it with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

type Handler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(u64, EventKind, Handler)>,
}

impl Registry {
    fn add(&mut self, kind: EventKind, handler: Handler) -> Subscription {
        self.next_id += 1;
        self.entries.push((self.next_id, kind, handler));
        Subscription(self.next_id)
    }

    fn remove(&mut self, sub: Subscription) {
        self.entries.retain(|(id, _, _)| *id != sub.0);
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect()
    }
}

struct Inner {
    config: ChatConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    registry: Mutex<Registry>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    joined: Mutex<HashSet<String>>,
    /// Serializes connection establishment so concurrent connect() calls
    /// share one transport session.
    connect_lock: TokioMutex<()>,
    /// Bumped by disconnect(); read loops and reconnect cycles carrying a
    /// stale generation stop instead of touching fresh state.
    generation: AtomicU64,
}

/// Cheaply cloneable handle to the one shared connection. Lifecycle is owned
/// by the top-level session, not by any individual subscriber.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ChatConfig, transport: Arc<dyn Transport>) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                config,
                transport,
                state: Mutex::new(ConnectionState::Idle),
                registry: Mutex::new(Registry::default()),
                outbound: Mutex::new(None),
                joined: Mutex::new(HashSet::new()),
                connect_lock: TokioMutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    /// Establish the transport session and authenticate. Idempotent: while a
    /// connect is in flight, concurrent callers wait on it and then observe
    /// the existing session instead of opening a second transport.
    ///
    /// Transient failures are retried with the same bounded backoff policy
    /// as reconnection; an auth rejection is fatal and returns immediately.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            debug!("connect() called while already connected; reusing session");
            return Ok(());
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let mut delay = self.inner.config.reconnect_base();

        for attempt in 1..=max_attempts {
            match self.establish(ConnectionState::Connecting, generation).await {
                Ok(()) => {
                    info!("Connected on attempt {}/{}", attempt, max_attempts);
                    return Ok(());
                }
                Err(ConnectionError::AuthRejected(message)) => {
                    error!("Authentication rejected: {}", message);
                    self.set_state(ConnectionState::Failed);
                    return Err(ConnectionError::AuthRejected(message));
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, max_attempts, e);
                }
            }

            if self.inner.generation.load(Ordering::SeqCst) != generation {
                debug!("connect() cancelled by disconnect");
                return Err(ConnectionError::Transport("cancelled".to_string()));
            }
            if attempt < max_attempts {
                let wait = jittered(delay);
                info!("Retrying connection in {:?}", wait);
                tokio::time::sleep(wait).await;
                delay = next_backoff(delay, self.inner.config.reconnect_max());
            }
        }

        error!("All {} connection attempts failed", max_attempts);
        self.set_state(ConnectionState::Failed);
        Err(ConnectionError::RetriesExhausted(max_attempts))
    }

    /// Tear down the session and cancel any reconnect cycle. The connection
    /// is a shared resource: only the top-level owner (logout path) calls
    /// this, never an individual subscriber on unmount.
    pub fn disconnect(&self) {
        info!("Disconnecting");
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        // Dropping the outbound sender closes the write half of the socket.
        *self.inner.outbound.lock().unwrap() = None;
        self.set_state(ConnectionState::Idle);
    }

    /// Non-blocking enqueue of an outbound frame.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        let tx = self
            .inner
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        tx.try_send(frame.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ConnectionError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })
    }

    /// Record a conversation key so it is (re-)joined on every successful
    /// handshake, and join it now when already connected.
    pub fn register_join(&self, conversation_key: &str) {
        let newly = self
            .inner
            .joined
            .lock()
            .unwrap()
            .insert(conversation_key.to_string());
        if newly && self.is_connected() {
            if let Err(e) = self.send(ClientFrame::Join {
                conversation_key: conversation_key.to_string(),
            }) {
                debug!("Deferred join of '{}': {}", conversation_key, e);
            }
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.inner.registry.lock().unwrap().add(kind, Arc::new(handler))
    }

    pub fn off(&self, sub: Subscription) {
        self.inner.registry.lock().unwrap().remove(sub);
    }

    /// Deliver an event to every subscriber of its kind. A panicking handler
    /// is logged and must not prevent delivery to the others.
    pub(crate) fn dispatch(&self, event: &ChatEvent) {
        let handlers = self
            .inner
            .registry
            .lock()
            .unwrap()
            .handlers_for(event.kind());
        for handler in handlers {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                error!("Event subscriber panicked; continuing delivery to the rest");
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == next {
                return;
            }
            debug!("Connection state {:?} -> {:?}", *state, next);
            *state = next;
        }
        self.dispatch(&ChatEvent::ConnectionState(next));
    }

    /// One full establishment: open transport, authenticate, re-join
    /// conversations, publish the outbound handle, spawn the read loop.
    async fn establish(
        &self,
        opening: ConnectionState,
        generation: u64,
    ) -> Result<(), ConnectionError> {
        self.set_state(opening);
        let mut session = self
            .inner
            .transport
            .open(&self.inner.config.server_url)
            .await?;

        self.set_state(ConnectionState::Authenticating);
        let auth_frame = ClientFrame::Auth {
            token: self.inner.config.token.clone(),
        };
        session
            .outbound
            .send(auth_frame.encode())
            .await
            .map_err(|_| ConnectionError::Transport("closed before handshake".to_string()))?;

        let handshake = async {
            while let Some(text) = session.inbound.recv().await {
                match parse_server_frame(&text) {
                    Some(ServerEvent::AuthOk { user_id }) => return Ok(user_id),
                    Some(ServerEvent::AuthError { message }) => {
                        return Err(ConnectionError::AuthRejected(message))
                    }
                    Some(other) => debug!("Ignoring pre-auth frame: {:?}", other),
                    None => {}
                }
            }
            Err(ConnectionError::Transport(
                "closed during handshake".to_string(),
            ))
        };
        let user_id = tokio::time::timeout(self.inner.config.auth_timeout(), handshake)
            .await
            .map_err(|_| ConnectionError::Timeout("authentication handshake"))??;
        debug!("Authenticated as {}", user_id);

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return Err(ConnectionError::Transport("cancelled".to_string()));
        }

        // Re-join every previously joined conversation before reporting
        // Connected, so no subscriber observes a joined-less session.
        let joined: Vec<String> = self
            .inner
            .joined
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        for conversation_key in joined {
            let join = ClientFrame::Join { conversation_key };
            if session.outbound.send(join.encode()).await.is_err() {
                return Err(ConnectionError::Transport(
                    "closed while re-joining conversations".to_string(),
                ));
            }
        }

        *self.inner.outbound.lock().unwrap() = Some(session.outbound.clone());
        self.set_state(ConnectionState::Connected);

        let manager = self.clone();
        let inbound = session.inbound;
        tokio::spawn(async move {
            manager.read_loop(inbound, generation).await;
        });
        Ok(())
    }

    /// Drains inbound frames for one session and fans them out. When the
    /// stream ends without an explicit disconnect, starts the reconnect
    /// cycle.
    async fn read_loop(self, mut inbound: mpsc::Receiver<String>, generation: u64) {
        while let Some(text) = inbound.recv().await {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let event = match parse_server_frame(&text) {
                Some(event) => event,
                None => continue, // malformed frames are logged by the parser
            };
            match event {
                ServerEvent::Message(message) => {
                    self.dispatch(&ChatEvent::Message(message));
                }
                ServerEvent::Typing { user_id, is_typing } => {
                    self.dispatch(&ChatEvent::Typing { user_id, is_typing });
                }
                ServerEvent::Presence { is_online } => {
                    self.dispatch(&ChatEvent::Presence { is_online });
                }
                ServerEvent::SeenAck {
                    message_id,
                    seen_at,
                    is_read,
                } => {
                    self.dispatch(&ChatEvent::SeenAck {
                        message_id,
                        seen_at,
                        is_read,
                    });
                }
                ServerEvent::AppError { message } => {
                    warn!("Application error from server: {}", message);
                    self.dispatch(&ChatEvent::Error { message });
                }
                ServerEvent::AuthOk { .. } | ServerEvent::AuthError { .. } => {
                    debug!("Ignoring auth frame outside the handshake");
                }
            }
        }

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Session closed by explicit disconnect");
            return;
        }

        warn!("Transport dropped unexpectedly");
        *self.inner.outbound.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_loop(generation).await;
    }

    /// Exponential backoff: base delay doubling up to the configured cap,
    /// bounded attempt count, cancelled by disconnect(). A fatal auth
    /// rejection during re-handshake stops the cycle immediately.
    // Returns a boxed future to break the recursive opaque-type cycle
    // (establish -> read_loop -> reconnect_loop -> establish) so the
    // spawned future can be proven `Send`.
    fn reconnect_loop(
        &self,
        generation: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        self.set_state(ConnectionState::Reconnecting);
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let mut delay = self.inner.config.reconnect_base();

        for attempt in 1..=max_attempts {
            let wait = jittered(delay);
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt, max_attempts, wait
            );
            tokio::time::sleep(wait).await;
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                debug!("Reconnect cycle cancelled by disconnect");
                return;
            }

            let _guard = self.inner.connect_lock.lock().await;
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if self.is_connected() {
                // A concurrent connect() call won the race.
                return;
            }
            match self
                .establish(ConnectionState::Reconnecting, generation)
                .await
            {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    return;
                }
                Err(ConnectionError::AuthRejected(message)) => {
                    error!("Authentication rejected during reconnect: {}", message);
                    self.set_state(ConnectionState::Failed);
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {}/{} failed: {}", attempt, max_attempts, e);
                    delay = next_backoff(delay, self.inner.config.reconnect_max());
                }
            }
        }

        error!("Giving up after {} reconnect attempts", max_attempts);
        self.set_state(ConnectionState::Failed);
        })
    }
}

fn next_backoff(delay: Duration, cap: Duration) -> Duration {
    std::cmp::min(delay * 2, cap)
}

fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}
