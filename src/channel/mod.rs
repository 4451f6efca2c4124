//! Reconnecting, authenticated event channel.
//!
//! ## Design
//! - One WebSocket per process, owned by a background task (see `connection`).
//! - Handlers register per chapter and receive only events scoped to it.
//! - Dispatch snapshots the matching handlers and releases the registry lock
//!   before invoking them, so a handler may subscribe or unsubscribe freely.
//! - Each registration sees each dispatched event at most once.
//! - [`ConnectionState`] is published on a watch channel; `GaveUp` is a
//!   connectivity failure, distinct from any narration failure.

pub mod connection;
pub mod reconnect;

pub use reconnect::ReconnectPolicy;

use crate::config::ChannelConfig;
use crate::narration::events::{self, NarrationEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback invoked for every event in a subscriber's chapter scope.
pub type EventHandler = Arc<dyn Fn(&NarrationEvent) + Send + Sync>;

/// Supplies the current auth token at connect time.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid auth header: {0}")]
    InvalidHeader(String),
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out after {0}s")]
    Timeout(u64),
}

/// Connectivity of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    GaveUp,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::GaveUp => f.write_str("gave up"),
        }
    }
}

struct Registration {
    chapter_id: String,
    handler: EventHandler,
}

pub struct EventChannel {
    url: String,
    config: ChannelConfig,
    token: TokenProvider,
    handlers: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(url: impl Into<String>, config: ChannelConfig) -> Arc<Self> {
        Self::with_token_provider(url, config, Arc::new(|| None::<String>))
    }

    /// The provider is called on every (re)connect, so a refreshed token is
    /// picked up without rebuilding the channel.
    pub fn with_token_provider(
        url: impl Into<String>,
        config: ChannelConfig,
        token: TokenProvider,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            url: url.into(),
            config,
            token,
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state,
            shutdown: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn current_token(&self) -> Option<String> {
        (self.token)()
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Register `handler` for events of `chapter_id`. Dropping the returned
    /// [`Subscription`] unregisters it.
    pub fn subscribe(self: &Arc<Self>, chapter_id: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(
            id,
            Registration {
                chapter_id: chapter_id.to_string(),
                handler,
            },
        );
        tracing::debug!(chapter_id, subscription = id, "Event handler subscribed");
        Subscription {
            id,
            channel: Arc::downgrade(self),
        }
    }

    /// Returns whether a registration was removed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.handlers.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = id, "Event handler unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Deliver an event to every handler scoped to its chapter. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&self, event: &NarrationEvent) -> usize {
        let targets: Vec<EventHandler> = self
            .handlers
            .lock()
            .values()
            .filter(|r| r.chapter_id == event.chapter_id())
            .map(|r| Arc::clone(&r.handler))
            .collect();

        for handler in &targets {
            handler(event);
        }
        targets.len()
    }

    /// Decode a raw frame and dispatch it. Undecodable and foreign frames
    /// are dropped.
    pub fn dispatch_frame(&self, frame: &str) -> usize {
        match events::decode_frame(frame) {
            Ok(Some(event)) => {
                tracing::debug!(
                    event = %event.kind(),
                    chapter_id = event.chapter_id(),
                    "Narration event received"
                );
                self.dispatch(&event)
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable frame");
                0
            }
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Start the background connection task. A no-op while one is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();
        tracing::info!(url = %self.url, "Opening event channel");
        *task = Some(tokio::spawn(connection::run(Arc::downgrade(self), token)));
    }

    /// Stop the background task and wait for it to close the socket.
    pub async fn disconnect(&self) {
        self.shutdown.lock().cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(url = %self.url, "Event channel closed");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.shutdown.get_mut().cancel();
    }
}

/// Handle to a handler registration; unregisters on drop.
pub struct Subscription {
    id: u64,
    channel: Weak<EventChannel>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narration::events::SpeechUpdate;
    use crate::narration::state::SpeechStatus;
    use std::sync::atomic::AtomicUsize;

    fn channel() -> Arc<EventChannel> {
        EventChannel::new("ws://127.0.0.1:1", ChannelConfig::default())
    }

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler: EventHandler = Arc::new(move |_: &NarrationEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    fn progress(chapter: &str) -> NarrationEvent {
        NarrationEvent::Progress(SpeechUpdate {
            chapter_id: chapter.into(),
            speech_id: "s1".into(),
            status: SpeechStatus::Processing,
            progress: 10,
            audio_url: None,
            error: None,
            job_id: None,
        })
    }

    #[test]
    fn dispatch_is_scoped_by_chapter() {
        let channel = channel();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let _a = channel.subscribe("a", a);
        let _b = channel.subscribe("b", b);

        assert_eq!(channel.dispatch(&progress("a")), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn each_handler_sees_an_event_once() {
        let channel = channel();
        let (count, handler) = counter();
        let _first = channel.subscribe("a", Arc::clone(&handler));
        let _second = channel.subscribe("a", handler);
        assert_eq!(channel.dispatch(&progress("a")), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let channel = channel();
        let (count, handler) = counter();
        let subscription = channel.subscribe("a", handler);
        assert_eq!(channel.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.dispatch(&progress("a")), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handlers_may_unsubscribe_during_dispatch() {
        let channel = channel();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let subscription = channel.subscribe(
            "a",
            Arc::new(move |_: &NarrationEvent| {
                inner.lock().take();
            }),
        );
        *slot.lock() = Some(subscription);

        assert_eq!(channel.dispatch(&progress("a")), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn frames_are_decoded_before_dispatch() {
        let channel = channel();
        let (count, handler) = counter();
        let _sub = channel.subscribe("a", handler);
        assert_eq!(channel.dispatch_frame(&progress("a").to_frame()), 1);
        assert_eq!(channel.dispatch_frame("garbage"), 0);
        assert_eq!(channel.dispatch_frame(r#"{"event":"ai:stream","data":{}}"#), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_starts_disconnected() {
        let channel = channel();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.set_state(ConnectionState::Reconnecting { attempt: 2 });
        assert_eq!(
            *channel.connection_state().borrow(),
            ConnectionState::Reconnecting { attempt: 2 }
        );
        assert_eq!(channel.state().to_string(), "reconnecting (attempt 2)");
    }
}
