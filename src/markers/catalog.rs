//! Static catalog of narration markers.
//!
//! Every marker exists in two spellings:
//! - the **visual** form writers type in the editor (`[pausa 500ms]`, `[ênfase]…[/ênfase]`)
//! - the **markup** form sent to the TTS engine (`<break time="500ms"/>`, `<emphasis …>`)
//!
//! Each definition describes its opening token in both spellings through a
//! template with at most one `{}` parameter slot. Match patterns are derived
//! from those templates, so a token rendered from captured parameters is always
//! re-recognised by the opposite pattern and converts back to the exact input.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Grouping used by the editor toolbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerCategory {
    Pause,
    Emphasis,
    Prosody,
    Effect,
}

/// Whether a marker stands alone or wraps a span of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    SelfClosing,
    Wrapping,
}

/// A token template split around its single `{}` parameter slot.
#[derive(Debug, Clone, Copy)]
struct Template {
    prefix: &'static str,
    suffix: &'static str,
}

impl Template {
    fn parse(raw: &'static str) -> Self {
        match raw.split_once("{}") {
            Some((prefix, suffix)) => Self { prefix, suffix },
            None => Self {
                prefix: raw,
                suffix: "",
            },
        }
    }

    fn render(self, param: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + param.len() + self.suffix.len());
        out.push_str(self.prefix);
        out.push_str(param);
        out.push_str(self.suffix);
        out
    }

    fn pattern(self, param: Option<&str>) -> String {
        match param {
            Some(param) => format!(
                "{}({}){}",
                regex::escape(self.prefix),
                param,
                regex::escape(self.suffix)
            ),
            None => regex::escape(self.prefix),
        }
    }
}

/// Source table entry; compiled into a [`MarkerDefinition`] on first use.
struct MarkerSource {
    id: &'static str,
    label: &'static str,
    description: &'static str,
    category: MarkerCategory,
    kind: MarkerKind,
    visual: &'static str,
    visual_close: Option<&'static str>,
    markup: &'static str,
    markup_close: Option<&'static str>,
    /// Regex for the parameter slot. `None` for parameterless markers.
    param: Option<&'static str>,
    /// Parameter used when the toolbar inserts a fresh marker.
    default_param: &'static str,
}

const SOURCES: [MarkerSource; 7] = [
    MarkerSource {
        id: "pause",
        label: "Pausa",
        description: "Insere uma pausa na narração",
        category: MarkerCategory::Pause,
        kind: MarkerKind::SelfClosing,
        visual: "[pausa {}]",
        visual_close: None,
        markup: "<break time=\"{}\"/>",
        markup_close: None,
        param: Some("[0-9]+(?:ms|s)"),
        default_param: "500ms",
    },
    MarkerSource {
        id: "emphasis",
        label: "Ênfase",
        description: "Enfatiza o trecho selecionado",
        category: MarkerCategory::Emphasis,
        kind: MarkerKind::Wrapping,
        visual: "[ênfase]",
        visual_close: Some("[/ênfase]"),
        markup: "<emphasis level=\"moderate\">",
        markup_close: Some("</emphasis>"),
        param: None,
        default_param: "",
    },
    MarkerSource {
        id: "pitch-up",
        label: "Tom+",
        description: "Aumenta o tom da voz",
        category: MarkerCategory::Prosody,
        kind: MarkerKind::Wrapping,
        visual: "[tom {}]",
        visual_close: Some("[/tom]"),
        markup: "<prosody pitch=\"{}st\">",
        markup_close: Some("</prosody>"),
        param: Some(r"\+[0-9]+"),
        default_param: "+2",
    },
    MarkerSource {
        id: "pitch-down",
        label: "Tom-",
        description: "Diminui o tom da voz",
        category: MarkerCategory::Prosody,
        kind: MarkerKind::Wrapping,
        visual: "[tom {}]",
        visual_close: Some("[/tom]"),
        markup: "<prosody pitch=\"{}st\">",
        markup_close: Some("</prosody>"),
        param: Some("-[0-9]+"),
        default_param: "-2",
    },
    MarkerSource {
        id: "whisper",
        label: "Sussurro",
        description: "Voz sussurrada",
        category: MarkerCategory::Effect,
        kind: MarkerKind::Wrapping,
        visual: "[sussurro]",
        visual_close: Some("[/sussurro]"),
        markup: "<amazon:effect name=\"whispered\">",
        markup_close: Some("</amazon:effect>"),
        param: None,
        default_param: "",
    },
    MarkerSource {
        id: "volume-loud",
        label: "Forte",
        description: "Volume alto",
        category: MarkerCategory::Prosody,
        kind: MarkerKind::Wrapping,
        visual: "[forte]",
        visual_close: Some("[/forte]"),
        markup: "<prosody volume=\"loud\">",
        markup_close: Some("</prosody>"),
        param: None,
        default_param: "",
    },
    MarkerSource {
        id: "volume-soft",
        label: "Suave",
        description: "Volume suave",
        category: MarkerCategory::Prosody,
        kind: MarkerKind::Wrapping,
        visual: "[suave]",
        visual_close: Some("[/suave]"),
        markup: "<prosody volume=\"soft\">",
        markup_close: Some("</prosody>"),
        param: None,
        default_param: "",
    },
];

/// One marker kind, immutable for the lifetime of the process.
#[derive(Debug)]
pub struct MarkerDefinition {
    /// Unique identifier (`pause`, `emphasis`, `pitch-up`, ...).
    pub id: &'static str,
    /// Display label in the toolbar and in rendered segments.
    pub label: &'static str,
    /// Short description for tooltips.
    pub description: &'static str,
    pub category: MarkerCategory,
    pub kind: MarkerKind,
    /// Visual literal the toolbar inserts (default parameter applied).
    pub visual_open: String,
    /// Visual closing token; `None` for self-closing markers.
    pub visual_close: Option<&'static str>,
    /// Markup closing token; `None` for self-closing markers.
    pub markup_close: Option<&'static str>,
    /// Matches the visual opening (or self-closing) token, group 1 = parameter.
    pub visual_pattern: Regex,
    /// Matches the markup opening (or self-closing) token, group 1 = parameter.
    pub markup_pattern: Regex,
    /// Declaration order; breaks ties between matches at the same offset.
    pub order: usize,
    visual_template: Template,
    markup_template: Template,
}

impl MarkerDefinition {
    fn compile(order: usize, source: &MarkerSource) -> Self {
        let visual_template = Template::parse(source.visual);
        let markup_template = Template::parse(source.markup);
        Self {
            id: source.id,
            label: source.label,
            description: source.description,
            category: source.category,
            kind: source.kind,
            visual_open: visual_template.render(source.default_param),
            visual_close: source.visual_close,
            markup_close: source.markup_close,
            visual_pattern: Regex::new(&visual_template.pattern(source.param)).unwrap(),
            markup_pattern: Regex::new(&markup_template.pattern(source.param)).unwrap(),
            order,
            visual_template,
            markup_template,
        }
    }

    pub fn is_wrapping(&self) -> bool {
        self.kind == MarkerKind::Wrapping
    }

    /// Render the markup token for a visual match.
    pub fn to_markup(&self, captures: &Captures<'_>) -> String {
        self.markup_template.render(param_of(captures))
    }

    /// Render the visual token for a markup match.
    pub fn to_visual(&self, captures: &Captures<'_>) -> String {
        self.visual_template.render(param_of(captures))
    }

    /// Rebuild the visual opening token from a segment parameter.
    pub fn visual_token(&self, param: Option<&str>) -> String {
        self.visual_template.render(param.unwrap_or_default())
    }
}

fn param_of<'t>(captures: &Captures<'t>) -> &'t str {
    captures.get(1).map_or("", |m| m.as_str())
}

static CATALOG: LazyLock<Vec<MarkerDefinition>> = LazyLock::new(|| {
    SOURCES
        .iter()
        .enumerate()
        .map(|(order, source)| MarkerDefinition::compile(order, source))
        .collect()
});

/// All marker definitions in declaration order.
pub fn markers() -> &'static [MarkerDefinition] {
    &CATALOG
}

/// Look up a marker by id.
pub fn find(id: &str) -> Option<&'static MarkerDefinition> {
    CATALOG.iter().find(|def| def.id == id)
}

/// First definition (in declaration order) that closes with `token` in visual form.
pub(crate) fn owner_of_visual_close(token: &str) -> Option<&'static MarkerDefinition> {
    CATALOG.iter().find(|def| def.visual_close == Some(token))
}

/// Distinct closing tokens in declaration order, for either spelling.
pub(crate) fn closing_tokens(visual: bool) -> Vec<&'static str> {
    let mut tokens: Vec<&'static str> = Vec::new();
    for def in CATALOG.iter() {
        let close = if visual { def.visual_close } else { def.markup_close };
        if let Some(close) = close {
            if !tokens.contains(&close) {
                tokens.push(close);
            }
        }
    }
    tokens
}
