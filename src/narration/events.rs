//! Wire schema for narration events pushed over the event channel.
//!
//! ## Protocol
//!
//! ```text
//! Backend job ──▸ event channel ──▸ EventChannel::dispatch ──▸ per-chapter handlers
//! ```
//!
//! Frames are JSON text, either an object envelope
//! `{"event": "narration:progress", "data": {...}}` or the array form
//! `["narration:progress", {...}]`. Payload fields are camelCase and scoped by
//! `chapterId`.
//!
//! The worker does not always send every field: speech events may omit
//! `status`/`progress` and the terminal event may carry `completedSpeeches`
//! instead of `totalAudios`. Decoding fills the gaps from the event name.

use super::state::SpeechStatus;
use serde::Deserialize;
use serde_json::{json, Value};

/// Event names the narration protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Progress,
    SpeechCompleted,
    SpeechFailed,
    Completed,
    Failed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::Started,
        Self::Progress,
        Self::SpeechCompleted,
        Self::SpeechFailed,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "narration:started",
            Self::Progress => "narration:progress",
            Self::SpeechCompleted => "narration:speech-completed",
            Self::SpeechFailed => "narration:speech-failed",
            Self::Completed => "narration:completed",
            Self::Failed => "narration:failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-speech payload shared by `progress`, `speech-completed` and `speech-failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechUpdate {
    pub chapter_id: String,
    pub speech_id: String,
    pub status: SpeechStatus,
    /// 0–100.
    pub progress: u8,
    pub audio_url: Option<String>,
    pub error: Option<String>,
    pub job_id: Option<String>,
}

/// A decoded narration event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationEvent {
    Started {
        chapter_id: String,
        total_speeches: u32,
        job_id: Option<String>,
    },
    Progress(SpeechUpdate),
    SpeechCompleted(SpeechUpdate),
    SpeechFailed(SpeechUpdate),
    Completed {
        chapter_id: String,
        /// Authoritative count of produced audios, when the backend sends one.
        total_audios: Option<u32>,
        job_id: Option<String>,
    },
    Failed {
        chapter_id: String,
        error: String,
        job_id: Option<String>,
    },
}

impl NarrationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::Progress(_) => EventKind::Progress,
            Self::SpeechCompleted(_) => EventKind::SpeechCompleted,
            Self::SpeechFailed(_) => EventKind::SpeechFailed,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
        }
    }

    pub fn chapter_id(&self) -> &str {
        match self {
            Self::Started { chapter_id, .. }
            | Self::Completed { chapter_id, .. }
            | Self::Failed { chapter_id, .. } => chapter_id,
            Self::Progress(update) | Self::SpeechCompleted(update) | Self::SpeechFailed(update) => {
                &update.chapter_id
            }
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id.as_deref(),
            Self::Progress(update) | Self::SpeechCompleted(update) | Self::SpeechFailed(update) => {
                update.job_id.as_deref()
            }
        }
    }

    /// The per-speech payload, for progress-class events.
    pub fn speech_update(&self) -> Option<&SpeechUpdate> {
        match self {
            Self::Progress(update) | Self::SpeechCompleted(update) | Self::SpeechFailed(update) => {
                Some(update)
            }
            _ => None,
        }
    }

    /// Encode as an object-envelope frame.
    pub fn to_frame(&self) -> String {
        let data = match self {
            Self::Started {
                chapter_id,
                total_speeches,
                job_id,
            } => json!({
                "chapterId": chapter_id,
                "totalSpeeches": total_speeches,
                "jobId": job_id,
            }),
            Self::Progress(update) | Self::SpeechCompleted(update) | Self::SpeechFailed(update) => {
                json!({
                    "chapterId": update.chapter_id,
                    "speechId": update.speech_id,
                    "status": update.status,
                    "progress": update.progress,
                    "audioUrl": update.audio_url,
                    "error": update.error,
                    "jobId": update.job_id,
                })
            }
            Self::Completed {
                chapter_id,
                total_audios,
                job_id,
            } => json!({
                "chapterId": chapter_id,
                "totalAudios": total_audios,
                "jobId": job_id,
            }),
            Self::Failed {
                chapter_id,
                error,
                job_id,
            } => json!({
                "chapterId": chapter_id,
                "error": error,
                "jobId": job_id,
            }),
        };
        json!({ "event": self.kind().as_str(), "data": data }).to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not an event envelope")]
    NotAnEnvelope,
    #[error("{event} is missing `{field}`")]
    MissingField {
        event: EventKind,
        field: &'static str,
    },
}

// ── Raw payload ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPayload {
    chapter_id: Option<Value>,
    job_id: Option<Value>,
    total_speeches: Option<u32>,
    speech_id: Option<Value>,
    status: Option<String>,
    progress: Option<f64>,
    audio_url: Option<String>,
    error: Option<String>,
    failed_reason: Option<String>,
    total_audios: Option<u32>,
    completed_speeches: Option<u32>,
}

/// Ids arrive as strings from most emitters but as numbers from some.
fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn clamp_progress(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

fn split_frame(frame: &str) -> Result<(String, Value), DecodeError> {
    match serde_json::from_str::<Value>(frame)? {
        Value::Object(mut map) => {
            let Some(Value::String(name)) = map.remove("event") else {
                return Err(DecodeError::NotAnEnvelope);
            };
            let data = map.remove("data").unwrap_or(Value::Null);
            Ok((name, data))
        }
        Value::Array(items) => {
            let mut items = items.into_iter();
            let Some(Value::String(name)) = items.next() else {
                return Err(DecodeError::NotAnEnvelope);
            };
            Ok((name, items.next().unwrap_or(Value::Null)))
        }
        _ => Err(DecodeError::NotAnEnvelope),
    }
}

/// Decode a payload for an already-known event kind.
pub fn decode_payload(kind: EventKind, data: Value) -> Result<NarrationEvent, DecodeError> {
    let raw: RawPayload = if data.is_null() {
        RawPayload::default()
    } else {
        serde_json::from_value(data)?
    };
    let missing = |field| DecodeError::MissingField { event: kind, field };

    let chapter_id = id_string(raw.chapter_id).ok_or_else(|| missing("chapterId"))?;
    let job_id = id_string(raw.job_id);

    let event = match kind {
        EventKind::Started => NarrationEvent::Started {
            chapter_id,
            total_speeches: raw.total_speeches.unwrap_or(0),
            job_id,
        },
        EventKind::Progress | EventKind::SpeechCompleted | EventKind::SpeechFailed => {
            let speech_id = id_string(raw.speech_id).ok_or_else(|| missing("speechId"))?;
            let (status, default_progress) = match kind {
                EventKind::SpeechCompleted => (SpeechStatus::Completed, 100.0),
                EventKind::SpeechFailed => (SpeechStatus::Failed, 0.0),
                _ => (
                    raw.status
                        .as_deref()
                        .and_then(SpeechStatus::parse)
                        .unwrap_or(SpeechStatus::Processing),
                    0.0,
                ),
            };
            let update = SpeechUpdate {
                chapter_id,
                speech_id,
                status,
                progress: clamp_progress(raw.progress.unwrap_or(default_progress)),
                audio_url: raw.audio_url,
                error: raw.error,
                job_id,
            };
            match kind {
                EventKind::SpeechCompleted => NarrationEvent::SpeechCompleted(update),
                EventKind::SpeechFailed => NarrationEvent::SpeechFailed(update),
                _ => NarrationEvent::Progress(update),
            }
        }
        EventKind::Completed => NarrationEvent::Completed {
            chapter_id,
            total_audios: raw.total_audios.or(raw.completed_speeches),
            job_id,
        },
        EventKind::Failed => NarrationEvent::Failed {
            chapter_id,
            error: raw
                .error
                .or(raw.failed_reason)
                .unwrap_or_else(|| "Narration failed".to_string()),
            job_id,
        },
    };
    Ok(event)
}

/// Decode one channel frame.
///
/// Returns `Ok(None)` for well-formed frames of events this protocol does not
/// define (other features share the channel).
pub fn decode_frame(frame: &str) -> Result<Option<NarrationEvent>, DecodeError> {
    let (name, data) = split_frame(frame)?;
    match EventKind::from_name(&name) {
        Some(kind) => decode_payload(kind, data).map(Some),
        None => Ok(None),
    }
}
