//! Narration snapshot types and the pure event reducer.
//!
//! A [`NarrationSnapshot`] is immutable once published. Folding an event
//! produces a new snapshot (or `None` when the event does not apply), so
//! observers never see a half-applied update.

use super::events::{NarrationEvent, SpeechUpdate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Chapter-level narration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrationStatus {
    #[default]
    Idle,
    Connecting,
    Narrating,
    Completed,
    Failed,
}

impl NarrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Narrating => "narrating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for NarrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-speech status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SpeechStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechNarrationProgress {
    pub speech_id: String,
    pub status: SpeechStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&SpeechUpdate> for SpeechNarrationProgress {
    fn from(update: &SpeechUpdate) -> Self {
        Self {
            speech_id: update.speech_id.clone(),
            status: update.status,
            progress: update.progress.min(100),
            audio_url: update.audio_url.clone(),
            error: update.error.clone(),
        }
    }
}

/// Chapter narration state as seen by one client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationSnapshot {
    pub status: NarrationStatus,
    pub chapter_id: Option<String>,
    pub job_id: Option<String>,
    pub total_speeches: u32,
    pub completed_speeches: u32,
    pub speech_progress: HashMap<String, SpeechNarrationProgress>,
    pub error: Option<String>,
}

impl NarrationSnapshot {
    /// The initial idle shape, optionally bound to a chapter.
    pub fn idle(chapter_id: Option<String>) -> Self {
        Self {
            chapter_id,
            ..Self::default()
        }
    }

    /// Number of speeches whose latest update is `completed`.
    pub fn counted_completions(&self) -> u32 {
        let count = self
            .speech_progress
            .values()
            .filter(|p| p.status == SpeechStatus::Completed)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Fold one event. Returns `None` when the event is out of scope, the
    /// session is terminal, or nothing changes.
    ///
    /// Non-terminal sessions fold every kind: `started` or per-speech events
    /// may be lost in transit, and the terminal event still has to land.
    pub fn apply(&self, event: &NarrationEvent) -> Option<Self> {
        if self.status.is_terminal() {
            return None;
        }
        if let Some(chapter) = &self.chapter_id {
            if chapter != event.chapter_id() {
                return None;
            }
        }
        if let (Some(mine), Some(theirs)) = (self.job_id.as_deref(), event.job_id()) {
            if mine != theirs {
                return None;
            }
        }

        let mut next = self.clone();
        match event {
            NarrationEvent::Started {
                chapter_id,
                total_speeches,
                job_id,
            } => {
                next = Self {
                    status: NarrationStatus::Narrating,
                    chapter_id: Some(chapter_id.clone()),
                    job_id: job_id.clone().or_else(|| self.job_id.clone()),
                    total_speeches: *total_speeches,
                    ..Self::default()
                };
            }
            NarrationEvent::Progress(update)
            | NarrationEvent::SpeechCompleted(update)
            | NarrationEvent::SpeechFailed(update) => {
                next.speech_progress
                    .insert(update.speech_id.clone(), SpeechNarrationProgress::from(update));
                next.completed_speeches = next.counted_completions();
            }
            NarrationEvent::Completed { total_audios, .. } => {
                next.status = NarrationStatus::Completed;
                next.completed_speeches = total_audios.unwrap_or_else(|| next.counted_completions());
                next.error = None;
            }
            NarrationEvent::Failed { error, .. } => {
                next.status = NarrationStatus::Failed;
                next.error = Some(error.clone());
            }
        }

        (next != *self).then_some(next)
    }

    /// Rounded percentage of completed speeches, 0 when nothing is known.
    pub fn overall_progress(&self) -> u8 {
        if self.total_speeches == 0 {
            return 0;
        }
        let percent = (f64::from(self.completed_speeches) * 100.0 / f64::from(self.total_speeches))
            .round()
            .min(100.0);
        percent as u8
    }

    /// Narrating or waiting for the job to be confirmed.
    pub fn is_narrating(&self) -> bool {
        matches!(
            self.status,
            NarrationStatus::Narrating | NarrationStatus::Connecting
        )
    }

    pub fn is_idle(&self) -> bool {
        self.status == NarrationStatus::Idle
    }

    /// Speeches whose latest update is a failure, ordered by speech id.
    pub fn failed_speeches(&self) -> Vec<&SpeechNarrationProgress> {
        let mut failed: Vec<_> = self
            .speech_progress
            .values()
            .filter(|p| p.status == SpeechStatus::Failed)
            .collect();
        failed.sort_by(|a, b| a.speech_id.cmp(&b.speech_id));
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(total: u32) -> NarrationEvent {
        NarrationEvent::Started {
            chapter_id: "ch".into(),
            total_speeches: total,
            job_id: None,
        }
    }

    fn speech(id: &str, status: SpeechStatus) -> SpeechUpdate {
        SpeechUpdate {
            chapter_id: "ch".into(),
            speech_id: id.into(),
            status,
            progress: if status == SpeechStatus::Completed { 100 } else { 40 },
            audio_url: None,
            error: None,
            job_id: None,
        }
    }

    fn completed(id: &str) -> NarrationEvent {
        NarrationEvent::SpeechCompleted(speech(id, SpeechStatus::Completed))
    }

    fn fold(mut state: NarrationSnapshot, events: &[NarrationEvent]) -> NarrationSnapshot {
        for event in events {
            if let Some(next) = state.apply(event) {
                state = next;
            }
        }
        state
    }

    fn narrating(total: u32) -> NarrationSnapshot {
        fold(NarrationSnapshot::idle(Some("ch".into())), &[started(total)])
    }

    #[test]
    fn started_moves_to_narrating() {
        let state = narrating(4);
        assert_eq!(state.status, NarrationStatus::Narrating);
        assert_eq!(state.total_speeches, 4);
        assert!(state.speech_progress.is_empty());
        assert_eq!(state.error, None);
    }

    #[test]
    fn progress_upsert_is_idempotent() {
        let state = narrating(2).apply(&completed("a")).unwrap();
        assert_eq!(state.completed_speeches, 1);
        assert!(state.apply(&completed("a")).is_none());
    }

    #[test]
    fn upsert_replaces_previous_entry() {
        let mut failed = speech("a", SpeechStatus::Failed);
        failed.error = Some("tts".into());
        let state = fold(
            narrating(2),
            &[
                completed("a"),
                NarrationEvent::SpeechFailed(failed),
            ],
        );
        assert_eq!(state.completed_speeches, 0);
        let entry = &state.speech_progress["a"];
        assert_eq!(entry.status, SpeechStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("tts"));
        assert_eq!(state.failed_speeches().len(), 1);
    }

    #[test]
    fn out_of_order_completions_converge() {
        let forward = fold(narrating(3), &[completed("a"), completed("b"), completed("c")]);
        let reverse = fold(narrating(3), &[completed("c"), completed("a"), completed("b"), completed("a")]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.completed_speeches, 3);
        assert_eq!(forward.overall_progress(), 100);
    }

    #[test]
    fn terminal_count_is_authoritative() {
        let state = fold(
            narrating(5),
            &[
                completed("a"),
                NarrationEvent::Completed {
                    chapter_id: "ch".into(),
                    total_audios: Some(5),
                    job_id: None,
                },
            ],
        );
        assert_eq!(state.status, NarrationStatus::Completed);
        assert_eq!(state.completed_speeches, 5);

        let state = fold(
            narrating(5),
            &[
                completed("a"),
                NarrationEvent::Completed {
                    chapter_id: "ch".into(),
                    total_audios: None,
                    job_id: None,
                },
            ],
        );
        assert_eq!(state.completed_speeches, 1);
    }

    #[test]
    fn terminal_states_ignore_late_events() {
        let failed = narrating(2)
            .apply(&NarrationEvent::Failed {
                chapter_id: "ch".into(),
                error: "worker crashed".into(),
                job_id: None,
            })
            .unwrap();
        assert_eq!(failed.status, NarrationStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("worker crashed"));
        assert!(failed.apply(&completed("a")).is_none());
        assert!(failed.apply(&started(2)).is_none());
    }

    #[test]
    fn connecting_folds_a_lost_started_job() {
        let connecting = NarrationSnapshot {
            status: NarrationStatus::Connecting,
            ..NarrationSnapshot::idle(Some("ch".into()))
        };
        let state = fold(
            connecting.clone(),
            &[
                completed("a"),
                NarrationEvent::Completed {
                    chapter_id: "ch".into(),
                    total_audios: Some(3),
                    job_id: None,
                },
            ],
        );
        assert_eq!(state.status, NarrationStatus::Completed);
        assert_eq!(state.completed_speeches, 3);

        let failed = connecting
            .apply(&NarrationEvent::Failed {
                chapter_id: "ch".into(),
                error: "no speeches".into(),
                job_id: None,
            })
            .unwrap();
        assert_eq!(failed.status, NarrationStatus::Failed);
        assert_eq!(connecting.apply(&started(1)).unwrap().status, NarrationStatus::Narrating);
    }

    #[test]
    fn idle_session_follows_a_running_job() {
        let idle = NarrationSnapshot::idle(Some("ch".into()));
        let state = idle.apply(&completed("a")).unwrap();
        assert_eq!(state.status, NarrationStatus::Idle);
        assert_eq!(state.completed_speeches, 1);

        let state = state
            .apply(&NarrationEvent::Completed {
                chapter_id: "ch".into(),
                total_audios: None,
                job_id: None,
            })
            .unwrap();
        assert_eq!(state.status, NarrationStatus::Completed);
        assert_eq!(state.completed_speeches, 1);
    }

    #[test]
    fn other_chapters_and_jobs_are_dropped() {
        let state = NarrationSnapshot {
            job_id: Some("job-1".into()),
            ..narrating(2)
        };
        let mut other_chapter = speech("a", SpeechStatus::Completed);
        other_chapter.chapter_id = "other".into();
        assert!(state.apply(&NarrationEvent::SpeechCompleted(other_chapter)).is_none());

        let mut other_job = speech("a", SpeechStatus::Completed);
        other_job.job_id = Some("job-0".into());
        assert!(state.apply(&NarrationEvent::SpeechCompleted(other_job)).is_none());

        let mut same_job = speech("a", SpeechStatus::Completed);
        same_job.job_id = Some("job-1".into());
        assert!(state.apply(&NarrationEvent::SpeechCompleted(same_job)).is_some());
    }

    #[test]
    fn repeated_started_clears_progress() {
        let state = fold(narrating(3), &[completed("a"), started(4)]);
        assert_eq!(state.status, NarrationStatus::Narrating);
        assert_eq!(state.total_speeches, 4);
        assert!(state.speech_progress.is_empty());
        assert_eq!(state.completed_speeches, 0);

        assert!(narrating(3).apply(&started(3)).is_none());
    }

    #[test]
    fn overall_progress_rounds() {
        let state = fold(narrating(3), &[completed("a")]);
        assert_eq!(state.overall_progress(), 33);
        let state = fold(state, &[completed("b")]);
        assert_eq!(state.overall_progress(), 67);
        assert_eq!(NarrationSnapshot::default().overall_progress(), 0);
    }

    #[test]
    fn derived_flags() {
        assert!(NarrationSnapshot::default().is_idle());
        assert!(narrating(1).is_narrating());
        assert!(!narrating(1).is_idle());
    }
}
