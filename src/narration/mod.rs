//! Chapter narration: wire events, the snapshot reducer, the remote API and
//! the client session that ties them to the event channel.

pub mod api;
pub mod events;
pub mod session;
pub mod state;

pub use api::{
    ApiError, HttpNarrationApi, NarrationApi, RemoteJobState, RemoteNarrationStatus, SpeechAudio,
    StartAccepted,
};
pub use events::{decode_frame, DecodeError, EventKind, NarrationEvent, SpeechUpdate};
pub use session::{NarrationSession, SessionError};
pub use state::{NarrationSnapshot, NarrationStatus, SpeechNarrationProgress, SpeechStatus};
