//! Narration markers: the catalog, the visual ⇄ markup transducer and the
//! segment parser used by the editor.

pub mod catalog;
pub mod segments;
pub mod transducer;

pub use catalog::{find, markers, MarkerCategory, MarkerDefinition, MarkerKind};
pub use segments::{insertion_text, parse, reconstruct, TextSegment};
pub use transducer::{has_markup_tags, has_visual_markers, to_markup, to_visual};
