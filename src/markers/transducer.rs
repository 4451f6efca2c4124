//! Visual ⇄ markup conversion.
//!
//! ## Design
//! - One pass per call: every definition's pattern and every distinct closing
//!   literal is scanned independently, matches are merged by offset (ties by
//!   declaration order) and overlapping matches are skipped.
//! - Wrapping markers are paired with a stack. A closer pairs with the nearest
//!   unclosed opener that declares the same closing literal, which is how the
//!   shared `[/tom]` and `</prosody>` closers find their owner.
//! - Anything that does not convert (unknown syntax, unpaired openers or
//!   closers) is copied through byte for byte.
//! - `Regex` carries no cursor, so the shared compiled patterns are safe to use
//!   from any number of concurrent calls.

use super::catalog::{self, MarkerDefinition};
use regex::Captures;

/// Which spelling a piece of text is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Spelling {
    Visual,
    Markup,
}

impl Spelling {
    fn close_of(self, def: &MarkerDefinition) -> Option<&'static str> {
        match self {
            Self::Visual => def.visual_close,
            Self::Markup => def.markup_close,
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Visual => Self::Markup,
            Self::Markup => Self::Visual,
        }
    }
}

pub(crate) enum TokenKind<'t> {
    /// Opening or self-closing token.
    Open {
        def: &'static MarkerDefinition,
        captures: Captures<'t>,
    },
    /// Closing literal; its owner is only known after pairing.
    Close { literal: &'static str },
}

pub(crate) struct Token<'t> {
    pub start: usize,
    pub end: usize,
    order: usize,
    pub kind: TokenKind<'t>,
}

/// Collect every marker token in `text`, sorted by offset, overlaps removed.
pub(crate) fn tokenize(text: &str, spelling: Spelling) -> Vec<Token<'_>> {
    let defs = catalog::markers();
    let mut tokens = Vec::new();

    for def in defs {
        let pattern = match spelling {
            Spelling::Visual => &def.visual_pattern,
            Spelling::Markup => &def.markup_pattern,
        };
        for captures in pattern.captures_iter(text) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            tokens.push(Token {
                start: whole.start(),
                end: whole.end(),
                order: def.order,
                kind: TokenKind::Open { def, captures },
            });
        }
    }

    for (i, literal) in catalog::closing_tokens(spelling == Spelling::Visual)
        .into_iter()
        .enumerate()
    {
        for (start, _) in text.match_indices(literal) {
            tokens.push(Token {
                start,
                end: start + literal.len(),
                order: defs.len() + i,
                kind: TokenKind::Close { literal },
            });
        }
    }

    tokens.sort_by_key(|t| (t.start, t.order));

    let mut last_end = 0;
    tokens.retain(|t| {
        if t.start < last_end {
            return false;
        }
        last_end = t.end;
        true
    });
    tokens
}

/// For every token, the definition that owns it once pairing is done.
/// `None` means the token stays literal.
pub(crate) fn pair(
    tokens: &[Token<'_>],
    spelling: Spelling,
) -> Vec<Option<&'static MarkerDefinition>> {
    let mut owners = vec![None; tokens.len()];
    let mut open: Vec<(usize, &'static MarkerDefinition)> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        match &token.kind {
            TokenKind::Open { def, .. } if !def.is_wrapping() => owners[i] = Some(*def),
            TokenKind::Open { def, .. } => open.push((i, *def)),
            TokenKind::Close { literal } => {
                let nearest = open
                    .iter()
                    .rposition(|(_, def)| spelling.close_of(def) == Some(*literal));
                if let Some(pos) = nearest {
                    let (opener, def) = open.remove(pos);
                    owners[opener] = Some(def);
                    owners[i] = Some(def);
                }
            }
        }
    }
    owners
}

fn convert(text: &str, from: Spelling) -> String {
    let tokens = tokenize(text, from);
    if tokens.is_empty() {
        return text.to_owned();
    }
    let owners = pair(&tokens, from);
    let to = from.opposite();

    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut cursor = 0;
    for (token, owner) in tokens.iter().zip(owners) {
        out.push_str(&text[cursor..token.start]);
        cursor = token.end;

        let rendered = match (owner, &token.kind) {
            (Some(def), TokenKind::Open { captures, .. }) => Some(match from {
                Spelling::Visual => def.to_markup(captures),
                Spelling::Markup => def.to_visual(captures),
            }),
            (Some(def), TokenKind::Close { .. }) => to.close_of(def).map(str::to_owned),
            (None, _) => None,
        };
        match rendered {
            Some(rendered) => out.push_str(&rendered),
            None => out.push_str(&text[token.start..token.end]),
        }
    }
    out.push_str(&text[cursor..]);
    out
}

fn any_convertible(text: &str, spelling: Spelling) -> bool {
    let tokens = tokenize(text, spelling);
    !tokens.is_empty() && pair(&tokens, spelling).iter().any(Option::is_some)
}

/// Convert writer-facing visual markers to TTS markup.
pub fn to_markup(text: &str) -> String {
    convert(text, Spelling::Visual)
}

/// Convert TTS markup back to visual markers.
pub fn to_visual(text: &str) -> String {
    convert(text, Spelling::Markup)
}

/// Whether `text` contains at least one visual marker that would convert.
pub fn has_visual_markers(text: &str) -> bool {
    any_convertible(text, Spelling::Visual)
}

/// Whether `text` contains at least one markup tag that would convert.
pub fn has_markup_tags(text: &str) -> bool {
    any_convertible(text, Spelling::Markup)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISUAL: &str = "Ele disse [pausa 500ms] com [ênfase]muita força[/ênfase].";
    const MARKUP: &str =
        "Ele disse <break time=\"500ms\"/> com <emphasis level=\"moderate\">muita força</emphasis>.";

    #[test]
    fn end_to_end_sentence() {
        assert_eq!(to_markup(VISUAL), MARKUP);
        assert_eq!(to_visual(MARKUP), VISUAL);
    }

    #[test]
    fn every_kind_round_trips_both_ways() {
        let cases = [
            ("[pausa 2s]", "<break time=\"2s\"/>"),
            ("[ênfase]x[/ênfase]", "<emphasis level=\"moderate\">x</emphasis>"),
            ("[tom +3]x[/tom]", "<prosody pitch=\"+3st\">x</prosody>"),
            ("[tom -4]x[/tom]", "<prosody pitch=\"-4st\">x</prosody>"),
            (
                "[sussurro]x[/sussurro]",
                "<amazon:effect name=\"whispered\">x</amazon:effect>",
            ),
            ("[forte]x[/forte]", "<prosody volume=\"loud\">x</prosody>"),
            ("[suave]x[/suave]", "<prosody volume=\"soft\">x</prosody>"),
        ];
        for (visual, markup) in cases {
            assert_eq!(to_markup(visual), markup);
            assert_eq!(to_visual(markup), visual);
            assert_eq!(to_visual(&to_markup(visual)), visual);
            assert_eq!(to_markup(&to_visual(markup)), markup);
        }
    }

    #[test]
    fn mixed_sequence_round_trips() {
        let text = "[forte]A[/forte] [pausa 1s][tom -2]b [sussurro]c[/sussurro][/tom] \
                    [suave][ênfase]d[/ênfase][/suave][pausa 250ms]";
        assert_eq!(to_visual(&to_markup(text)), text);
    }

    #[test]
    fn plain_text_passes_through() {
        let text = "Olá, mundo!\n\t\u{0007} … ção 日本語 [sem marcador] <b>html</b>";
        assert_eq!(to_markup(text), text);
        assert_eq!(to_visual(text), text);
        assert_eq!(to_markup(""), "");
    }

    #[test]
    fn malformed_syntax_stays_literal() {
        for text in [
            "[pausa]",
            "[pausa 500]",
            "[pausa 500 ms]",
            "[tom 2]x[/tom]",
            "[ênfase]sem fim",
            "sem início[/ênfase]",
            "[/tom][tom +2]",
        ] {
            assert_eq!(to_markup(text), text, "{text}");
        }
        assert_eq!(
            to_visual("<emphasis level=\"strong\">x</emphasis>"),
            "<emphasis level=\"strong\">x</emphasis>"
        );
    }

    #[test]
    fn unpaired_pieces_do_not_block_valid_ones() {
        assert_eq!(
            to_markup("[ênfase]a [pausa 1s] b"),
            "[ênfase]a <break time=\"1s\"/> b"
        );
        assert_eq!(
            to_markup("[forte]a[/forte][/forte]"),
            "<prosody volume=\"loud\">a</prosody>[/forte]"
        );
    }

    #[test]
    fn shared_closer_pairs_with_nearest_opener() {
        let visual = "[tom +2]a [tom -1]b[/tom] c[/tom]";
        let markup = to_markup(visual);
        assert_eq!(
            markup,
            "<prosody pitch=\"+2st\">a <prosody pitch=\"-1st\">b</prosody> c</prosody>"
        );
        assert_eq!(to_visual(&markup), visual);

        let markup = "<prosody volume=\"loud\">a <prosody pitch=\"+1st\">b</prosody></prosody>";
        assert_eq!(to_visual(markup), "[forte]a [tom +1]b[/tom][/forte]");
    }

    #[test]
    fn pause_units_are_not_normalized() {
        assert_eq!(to_markup("[pausa 1000ms]"), "<break time=\"1000ms\"/>");
        assert_eq!(to_markup("[pausa 1s]"), "<break time=\"1s\"/>");
    }

    #[test]
    fn probes_report_only_convertible_markers() {
        assert!(has_visual_markers(VISUAL));
        assert!(!has_visual_markers("texto [ênfase] solto"));
        assert!(!has_visual_markers(MARKUP));
        assert!(has_markup_tags(MARKUP));
        assert!(!has_markup_tags(VISUAL));
        assert!(!has_visual_markers(""));
    }

    #[test]
    fn concurrent_calls_are_independent() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..100 {
                        assert_eq!(to_markup(VISUAL), MARKUP);
                        assert!(has_markup_tags(MARKUP));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
