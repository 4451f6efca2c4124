//! Renderable segments of visual text.
//!
//! `parse` splits editor text into plain text runs and typed marker pieces so
//! a renderer can draw chips for markers without losing any byte of the
//! source: [`reconstruct`] on the result always returns the input.

use super::catalog::{self, MarkerDefinition};
use super::transducer::{self, Spelling, TokenKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TextSegment {
    Text {
        content: String,
    },
    MarkerSelf {
        #[serde(rename = "markerId")]
        marker_id: String,
        label: String,
        param: String,
    },
    MarkerOpen {
        #[serde(rename = "markerId")]
        marker_id: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param: Option<String>,
    },
    MarkerClose {
        #[serde(rename = "markerId")]
        marker_id: String,
    },
}

impl TextSegment {
    /// Visual syntax this segment was parsed from.
    pub fn to_visual(&self) -> String {
        match self {
            Self::Text { content } => content.clone(),
            Self::MarkerSelf {
                marker_id, param, ..
            } => catalog::find(marker_id)
                .map(|def| def.visual_token(Some(param.as_str())))
                .unwrap_or_default(),
            Self::MarkerOpen {
                marker_id, param, ..
            } => catalog::find(marker_id)
                .map(|def| def.visual_token(param.as_deref()))
                .unwrap_or_default(),
            Self::MarkerClose { marker_id } => catalog::find(marker_id)
                .and_then(|def| def.visual_close)
                .map(str::to_owned)
                .unwrap_or_default(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

/// Concatenate segments back into visual text.
pub fn reconstruct(segments: &[TextSegment]) -> String {
    segments.iter().map(TextSegment::to_visual).collect()
}

/// Split visual text into ordered segments.
///
/// Every opener becomes a `MarkerOpen` and every closer a `MarkerClose`, paired
/// or not. A closer names the nearest unclosed opener sharing its literal; a
/// closer with no such opener is attributed to the first marker declaring it.
pub fn parse(text: &str) -> Vec<TextSegment> {
    if text.is_empty() {
        return Vec::new();
    }
    let tokens = transducer::tokenize(text, Spelling::Visual);
    if tokens.is_empty() {
        return vec![TextSegment::Text {
            content: text.to_owned(),
        }];
    }

    let mut segments = Vec::with_capacity(tokens.len() * 2 + 1);
    let mut open: Vec<&'static MarkerDefinition> = Vec::new();
    let mut cursor = 0;

    for token in &tokens {
        if token.start > cursor {
            segments.push(TextSegment::Text {
                content: text[cursor..token.start].to_owned(),
            });
        }
        cursor = token.end;

        let segment = match &token.kind {
            TokenKind::Open { def, captures } => {
                let param = captures.get(1).map(|m| m.as_str().to_owned());
                if def.is_wrapping() {
                    open.push(*def);
                    TextSegment::MarkerOpen {
                        marker_id: def.id.to_owned(),
                        label: def.label.to_owned(),
                        param,
                    }
                } else {
                    TextSegment::MarkerSelf {
                        marker_id: def.id.to_owned(),
                        label: def.label.to_owned(),
                        param: param.unwrap_or_default(),
                    }
                }
            }
            TokenKind::Close { literal } => {
                let owner = match open
                    .iter()
                    .rposition(|def| def.visual_close == Some(*literal))
                {
                    Some(pos) => Some(open.remove(pos)),
                    None => catalog::owner_of_visual_close(literal),
                };
                match owner {
                    Some(def) => TextSegment::MarkerClose {
                        marker_id: def.id.to_owned(),
                    },
                    None => TextSegment::Text {
                        content: (*literal).to_owned(),
                    },
                }
            }
        };
        segments.push(segment);
    }

    if cursor < text.len() {
        segments.push(TextSegment::Text {
            content: text[cursor..].to_owned(),
        });
    }
    segments
}

/// Text the toolbar inserts for `marker_id`.
///
/// Self-closing markers insert their default literal. Wrapping markers wrap
/// the selection, or a single space when nothing is selected.
pub fn insertion_text(marker_id: &str, selected: Option<&str>) -> Option<String> {
    let def = catalog::find(marker_id)?;
    match def.visual_close {
        None => Some(def.visual_open.clone()),
        Some(close) => {
            let inner = selected.filter(|s| !s.is_empty()).unwrap_or(" ");
            Some(format!("{}{inner}{close}", def.visual_open))
        }
    }
}
