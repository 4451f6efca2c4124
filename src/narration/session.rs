//! Per-chapter narration session.
//!
//! ## Design
//! - A session is bound to at most one chapter. Binding subscribes a handler
//!   on the [`EventChannel`]; rebinding drops the old subscription before the
//!   new one is registered.
//! - Every binding, reset and successful cancel opens a new *scope* with a
//!   fresh generation number. Handlers carry the generation they were created
//!   for, so an event already in flight for a previous scope is discarded.
//! - State lives in an immutable [`NarrationSnapshot`] behind an `Arc`;
//!   observers receive snapshots through a `watch` channel.
//! - `start()` and `cancel()` never move the status past `connecting` by
//!   themselves. Confirmation comes from channel events.

use super::api::{ApiError, NarrationApi, RemoteJobState, SpeechAudio, StartAccepted};
use super::events::NarrationEvent;
use super::state::{NarrationSnapshot, NarrationStatus};
use crate::channel::{EventChannel, EventHandler, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no chapter is bound to the session")]
    NoChapter,
    #[error("cannot {action} while {status}")]
    InvalidTransition {
        action: &'static str,
        status: NarrationStatus,
    },
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

struct Scope {
    chapter_id: String,
    generation: u64,
    _subscription: Subscription,
}

struct SessionCore {
    scope: Option<Scope>,
    generation: u64,
    snapshot: Arc<NarrationSnapshot>,
}

struct Shared {
    api: Arc<dyn NarrationApi>,
    channel: Arc<EventChannel>,
    core: Mutex<SessionCore>,
    snapshots: watch::Sender<Arc<NarrationSnapshot>>,
}

impl Shared {
    fn publish(&self, core: &mut SessionCore, next: NarrationSnapshot) {
        if *core.snapshot == next {
            return;
        }
        if core.snapshot.status != next.status {
            tracing::info!(
                chapter_id = next.chapter_id.as_deref().unwrap_or("-"),
                from = %core.snapshot.status,
                to = %next.status,
                "Narration status changed"
            );
        }
        let next = Arc::new(next);
        core.snapshot = Arc::clone(&next);
        self.snapshots.send_replace(next);
    }

    /// Replace the current scope. The old subscription is dropped first.
    fn open_scope(self: &Arc<Self>, core: &mut SessionCore, chapter_id: Option<String>) {
        core.scope = None;
        let Some(chapter_id) = chapter_id else {
            return;
        };

        core.generation += 1;
        let generation = core.generation;
        let weak: Weak<Shared> = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: &NarrationEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.apply_event(generation, event);
            }
        });
        let subscription = self.channel.subscribe(&chapter_id, handler);
        core.scope = Some(Scope {
            chapter_id,
            generation,
            _subscription: subscription,
        });
    }

    fn apply_event(&self, generation: u64, event: &NarrationEvent) {
        let mut core = self.core.lock();
        let in_scope = core
            .scope
            .as_ref()
            .is_some_and(|s| s.generation == generation && s.chapter_id == event.chapter_id());
        if !in_scope {
            tracing::debug!(
                event = %event.kind(),
                chapter_id = event.chapter_id(),
                "Dropping event from a stale scope"
            );
            return;
        }

        match core.snapshot.apply(event) {
            Some(next) => self.publish(&mut core, next),
            None => tracing::debug!(
                event = %event.kind(),
                status = %core.snapshot.status,
                "Event ignored"
            ),
        }
    }

    /// Chapter and generation of the bound scope.
    fn bound(core: &SessionCore) -> Result<(String, u64), SessionError> {
        core.scope
            .as_ref()
            .map(|s| (s.chapter_id.clone(), s.generation))
            .ok_or(SessionError::NoChapter)
    }
}

/// Cloneable handle to the client's narration session.
#[derive(Clone)]
pub struct NarrationSession {
    shared: Arc<Shared>,
}

impl NarrationSession {
    pub fn new(api: Arc<dyn NarrationApi>, channel: Arc<EventChannel>) -> Self {
        let initial = Arc::new(NarrationSnapshot::default());
        let (snapshots, _) = watch::channel(Arc::clone(&initial));
        Self {
            shared: Arc::new(Shared {
                api,
                channel,
                core: Mutex::new(SessionCore {
                    scope: None,
                    generation: 0,
                    snapshot: initial,
                }),
                snapshots,
            }),
        }
    }

    /// Make `chapter_id` the active chapter. Switching chapters resets state.
    pub fn bind(&self, chapter_id: &str) {
        let mut core = self.shared.core.lock();
        if core
            .scope
            .as_ref()
            .is_some_and(|s| s.chapter_id == chapter_id)
        {
            return;
        }
        tracing::info!(chapter_id, "Binding narration session");
        self.shared.open_scope(&mut core, Some(chapter_id.to_string()));
        self.shared
            .publish(&mut core, NarrationSnapshot::idle(Some(chapter_id.to_string())));
    }

    /// Drop the active chapter and its subscription.
    pub fn unbind(&self) {
        let mut core = self.shared.core.lock();
        self.shared.open_scope(&mut core, None);
        self.shared.publish(&mut core, NarrationSnapshot::idle(None));
    }

    pub fn chapter_id(&self) -> Option<String> {
        self.shared
            .core
            .lock()
            .scope
            .as_ref()
            .map(|s| s.chapter_id.clone())
    }

    pub fn snapshot(&self) -> Arc<NarrationSnapshot> {
        Arc::clone(&self.shared.core.lock().snapshot)
    }

    /// Observe snapshots. The receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<NarrationSnapshot>> {
        self.shared.snapshots.subscribe()
    }

    /// Fold an event into the current scope, as if it came from the channel.
    pub fn handle_event(&self, event: &NarrationEvent) {
        let generation = self.shared.core.lock().scope.as_ref().map(|s| s.generation);
        if let Some(generation) = generation {
            self.shared.apply_event(generation, event);
        }
    }

    /// Request narration of the bound chapter.
    ///
    /// Valid from `idle` or `failed`. On rejection the session moves to
    /// `failed` with the backend's message.
    pub async fn start(&self) -> Result<StartAccepted, SessionError> {
        let (chapter_id, generation) = {
            let mut core = self.shared.core.lock();
            let (chapter_id, _) = Shared::bound(&core)?;
            let status = core.snapshot.status;
            if !matches!(status, NarrationStatus::Idle | NarrationStatus::Failed) {
                return Err(SessionError::InvalidTransition {
                    action: "start",
                    status,
                });
            }
            self.shared.open_scope(&mut core, Some(chapter_id.clone()));
            let connecting = NarrationSnapshot {
                status: NarrationStatus::Connecting,
                ..NarrationSnapshot::idle(Some(chapter_id.clone()))
            };
            self.shared.publish(&mut core, connecting);
            (chapter_id, core.generation)
        };

        tracing::info!(chapter_id = %chapter_id, "Requesting narration start");
        match self.shared.api.start_narration(&chapter_id).await {
            Ok(accepted) => {
                let mut core = self.shared.core.lock();
                let same_scope = Shared::bound(&core).is_ok_and(|(_, g)| g == generation);
                if same_scope && core.snapshot.job_id.is_none() && accepted.job_id.is_some() {
                    let next = NarrationSnapshot {
                        job_id: accepted.job_id.clone(),
                        ..(*core.snapshot).clone()
                    };
                    self.shared.publish(&mut core, next);
                }
                Ok(accepted)
            }
            Err(e) => {
                let message = e.user_message();
                tracing::warn!(chapter_id = %chapter_id, error = %e, "Narration start rejected");
                let mut core = self.shared.core.lock();
                let same_scope = Shared::bound(&core).is_ok_and(|(_, g)| g == generation);
                if same_scope && core.snapshot.status == NarrationStatus::Connecting {
                    let failed = NarrationSnapshot {
                        status: NarrationStatus::Failed,
                        error: Some(message.clone()),
                        ..(*core.snapshot).clone()
                    };
                    self.shared.publish(&mut core, failed);
                }
                Err(SessionError::Rejected(message))
            }
        }
    }

    /// Cancel the running job. On success the session is reset to idle and
    /// any late events of the cancelled job are discarded.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let (chapter_id, generation) = {
            let core = self.shared.core.lock();
            let bound = Shared::bound(&core)?;
            let status = core.snapshot.status;
            if !matches!(
                status,
                NarrationStatus::Narrating | NarrationStatus::Connecting
            ) {
                return Err(SessionError::InvalidTransition {
                    action: "cancel",
                    status,
                });
            }
            bound
        };

        tracing::info!(chapter_id = %chapter_id, "Requesting narration cancel");
        let result = self.shared.api.cancel_narration(&chapter_id).await;

        let mut core = self.shared.core.lock();
        let same_scope = Shared::bound(&core).is_ok_and(|(_, g)| g == generation);
        match result {
            Ok(()) => {
                if same_scope {
                    self.shared.open_scope(&mut core, Some(chapter_id.clone()));
                    self.shared
                        .publish(&mut core, NarrationSnapshot::idle(Some(chapter_id)));
                }
                Ok(())
            }
            Err(e) => {
                let message = e.user_message();
                tracing::warn!(chapter_id = %chapter_id, error = %e, "Narration cancel rejected");
                if same_scope {
                    let failed = NarrationSnapshot {
                        status: NarrationStatus::Failed,
                        error: Some(message.clone()),
                        ..(*core.snapshot).clone()
                    };
                    self.shared.publish(&mut core, failed);
                }
                Err(SessionError::Rejected(message))
            }
        }
    }

    /// Local reset to the initial idle shape. Keeps the bound chapter.
    pub fn reset(&self) {
        let mut core = self.shared.core.lock();
        let chapter_id = core.scope.as_ref().map(|s| s.chapter_id.clone());
        self.shared.open_scope(&mut core, chapter_id.clone());
        self.shared.publish(&mut core, NarrationSnapshot::idle(chapter_id));
    }

    /// Reconcile with the backend job state, typically after a reconnect.
    ///
    /// Only a `narrating` session is affected: a failed remote job moves it to
    /// `failed`, a completed one to `completed` keeping the local count.
    pub async fn resync(&self) -> Result<NarrationStatus, SessionError> {
        let (chapter_id, generation, job_id) = {
            let core = self.shared.core.lock();
            let (chapter_id, generation) = Shared::bound(&core)?;
            if core.snapshot.status != NarrationStatus::Narrating {
                return Ok(core.snapshot.status);
            }
            (chapter_id, generation, core.snapshot.job_id.clone())
        };

        let remote = self.shared.api.narration_status(&chapter_id).await?;
        tracing::debug!(chapter_id = %chapter_id, remote = ?remote.state, "Narration status fetched");

        let mut core = self.shared.core.lock();
        let same_scope = Shared::bound(&core).is_ok_and(|(_, g)| g == generation);
        let other_job = matches!(
            (job_id.as_deref(), remote.job_id.as_deref()),
            (Some(mine), Some(theirs)) if mine != theirs
        );
        if !same_scope || other_job || core.snapshot.status != NarrationStatus::Narrating {
            return Ok(core.snapshot.status);
        }

        let next = match remote.state {
            RemoteJobState::Failed => Some(NarrationSnapshot {
                status: NarrationStatus::Failed,
                error: Some(
                    remote
                        .failed_reason
                        .unwrap_or_else(|| "Narration failed".to_string()),
                ),
                ..(*core.snapshot).clone()
            }),
            RemoteJobState::Completed => Some(NarrationSnapshot {
                status: NarrationStatus::Completed,
                ..(*core.snapshot).clone()
            }),
            _ => None,
        };
        if let Some(next) = next {
            self.shared.publish(&mut core, next);
        }
        Ok(core.snapshot.status)
    }

    /// Regenerate audio for one speech, outside the chapter job.
    pub async fn generate_speech_audio(&self, speech_id: &str) -> Result<SpeechAudio, SessionError> {
        tracing::info!(speech_id, "Requesting single speech audio");
        Ok(self.shared.api.generate_speech_audio(speech_id).await?)
    }
}
