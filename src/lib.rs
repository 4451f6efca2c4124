//! Narration text and progress protocol for the Livrya writing studio.
//!
//! - [`markers`]: visual marker ⇄ TTS markup transducer and segment parser.
//! - [`narration`]: chapter narration events, state reducer, remote API and session.
//! - [`channel`]: reconnecting WebSocket event channel with per-chapter handlers.
//! - [`config`]: client configuration.

pub mod channel;
pub mod config;
pub mod markers;
pub mod narration;

pub use channel::{ConnectionState, EventChannel, ReconnectPolicy};
pub use config::StudioConfig;
pub use markers::{has_markup_tags, has_visual_markers, to_markup, to_visual, TextSegment};
pub use narration::{NarrationSession, NarrationSnapshot, NarrationStatus};
