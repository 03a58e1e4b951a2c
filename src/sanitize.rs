//! Raw model output → speakable, displayable text.
//!
//! Three independent stages:
//! - [`Sanitizer::clean`]: role prefixes, markdown, stage directions, emoji
//!   and enclosing quotes removed, whitespace collapsed, length capped.
//! - [`cap_sentences`]: at most two sentences.
//! - [`extract_assistant_reply`]: the usable completion inside echoed
//!   template output.
//!
//! None of these fail; each has a fixed fallback for empty results.

use crate::prompt::template::ASSISTANT_TAG;
use regex::Regex;
use std::sync::LazyLock;

/// Returned by [`Sanitizer::clean`] when nothing presentable is left.
pub const PLACEHOLDER: &str = "...";

/// Returned by [`cap_sentences`] when the input has no content.
pub const FILLER: &str = "okay.";

/// Display length cap, in UTF-16 code units.
pub const MAX_DISPLAY_UNITS: usize = 220;

const ELLIPSIS: &str = "...";

static CODE_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").ok());
static MARKDOWN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[*_`~>#]").ok());
static STAGE_DIRECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]+\)").ok());
static PICTOGRAPHIC: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"[\p{Extended_Pictographic}\x{FE0F}\x{200D}\x{2066}-\x{2069}]")
        .ok()
});
static ENCLOSING_QUOTES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new("^[\"'\u{201C}\u{201D}\u{2018}\u{2019}]+|[\"'\u{201C}\u{201D}\u{2018}\u{2019}]+$")
        .ok()
});
static WHITESPACE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\s+").ok());
static LEADING_FRAGMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\s|</?s>|<\|?[A-Za-z_]{1,12}\|?>|[A-Za-z_]{0,12}\|>|(?i:user|assistant)\s*:){0,8}",
    )
    .ok()
});

/// Output cleaner configured with the speaker names to strip.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    line_role: Option<Regex>,
    inline_role: Option<Regex>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(["User", "Misaki"])
    }
}

impl Sanitizer {
    /// Build a sanitizer that strips `Name:` prefixes for each role name.
    pub fn new<I, S>(role_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = role_names
            .into_iter()
            .map(|n| n.as_ref().trim().to_owned())
            .filter(|n| !n.is_empty())
            .map(|n| regex::escape(&n))
            .collect();
        if names.is_empty() {
            return Self {
                line_role: None,
                inline_role: None,
            };
        }
        let alternation = names.join("|");
        let line_role = Regex::new(&format!(r"(?i)(^|\n)\s*(?:{alternation})\s*:\s*")).ok();
        let inline_role = Regex::new(&format!(r"(?i)\b(?:{alternation})\s*:\s*")).ok();
        Self {
            line_role,
            inline_role,
        }
    }

    /// Clean raw model output. Accepts `&str` or `None`.
    ///
    /// Never returns an empty string; the result is at most
    /// [`MAX_DISPLAY_UNITS`] UTF-16 units plus the ellipsis.
    pub fn clean<'a>(&self, raw: impl Into<Option<&'a str>>) -> String {
        let Some(raw) = raw.into() else {
            return PLACEHOLDER.to_owned();
        };
        if raw.trim().is_empty() {
            return PLACEHOLDER.to_owned();
        }

        let mut text = raw.to_owned();
        if let Some(re) = &self.line_role {
            text = re.replace_all(&text, "$1").into_owned();
        }
        if let Some(re) = &self.inline_role {
            text = re.replace_all(&text, "").into_owned();
        }
        text = replace_all(&CODE_FENCE, &text, " ");
        text = replace_all(&MARKDOWN, &text, " ");
        text = replace_all(&STAGE_DIRECTION, &text, " ");
        text = replace_all(&PICTOGRAPHIC, &text, "");
        text = replace_all(&ENCLOSING_QUOTES, text.trim(), "");
        text = replace_all(&WHITESPACE, &text, " ").trim().to_owned();

        let text = truncate_display(text);
        if text.is_empty() {
            PLACEHOLDER.to_owned()
        } else {
            text
        }
    }
}

fn replace_all(re: &Option<Regex>, text: &str, replacement: &str) -> String {
    match re {
        Some(re) => re.replace_all(text, replacement).into_owned(),
        None => text.to_owned(),
    }
}

fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Cut to [`MAX_DISPLAY_UNITS`] and append the ellipsis. Text that already
/// carries a truncation ellipsis within bounds is left alone.
fn truncate_display(text: String) -> String {
    let units = utf16_len(&text);
    if units <= MAX_DISPLAY_UNITS {
        return text;
    }
    if units <= MAX_DISPLAY_UNITS + ELLIPSIS.len() && text.ends_with(ELLIPSIS) {
        return text;
    }
    let mut taken = 0;
    let mut end = 0;
    for (idx, ch) in text.char_indices() {
        if taken + ch.len_utf16() > MAX_DISPLAY_UNITS {
            break;
        }
        taken += ch.len_utf16();
        end = idx + ch.len_utf8();
    }
    format!("{}{ELLIPSIS}", text[..end].trim())
}

/// Keep at most the first two sentences.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace.
pub fn cap_sentences(text: &str) -> String {
    let mut sentences: Vec<&str> = Vec::with_capacity(2);
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if sentences.len() == 2 {
            break;
        }
        if matches!(ch, '.' | '!' | '?')
            && let Some(&(next_idx, next)) = chars.peek()
            && next.is_whitespace()
        {
            push_sentence(&mut sentences, &text[start..idx + ch.len_utf8()]);
            start = next_idx;
        }
    }
    if sentences.len() < 2 {
        push_sentence(&mut sentences, &text[start..]);
    }

    let capped = sentences.join(" ").trim().to_owned();
    if capped.is_empty() {
        FILLER.to_owned()
    } else {
        capped
    }
}

fn push_sentence<'a>(sentences: &mut Vec<&'a str>, segment: &'a str) {
    let segment = segment.trim();
    if !segment.is_empty() {
        sentences.push(segment);
    }
}

/// Pull the usable reply out of text that echoes the prompt template.
///
/// Takes what follows the last assistant tag (or the whole text when there
/// is none), cuts at the earliest stop marker, then drops leftover tag or
/// role fragments at the start.
pub fn extract_assistant_reply<S: AsRef<str>>(text: &str, stop_markers: &[S]) -> String {
    let after_tag = match text.rfind(ASSISTANT_TAG) {
        Some(pos) => &text[pos + ASSISTANT_TAG.len()..],
        None => text,
    };
    let cut = match earliest_marker(after_tag, stop_markers) {
        Some(pos) => &after_tag[..pos],
        None => after_tag,
    };
    match LEADING_FRAGMENT.as_ref() {
        Some(re) => re.replace(cut, "").trim().to_owned(),
        None => cut.trim().to_owned(),
    }
}

/// Byte offset of the earliest occurrence of any non-empty marker.
pub fn earliest_marker<S: AsRef<str>>(text: &str, markers: &[S]) -> Option<usize> {
    markers
        .iter()
        .filter_map(|marker| {
            let marker: &str = marker.as_ref();
            if marker.is_empty() {
                None
            } else {
                text.find(marker)
            }
        })
        .min()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn clean(raw: &str) -> String {
        Sanitizer::default().clean(raw)
    }

    #[test]
    fn empty_and_missing_input_yield_placeholder() {
        let sanitizer = Sanitizer::default();
        assert_eq!(sanitizer.clean(""), PLACEHOLDER);
        assert_eq!(sanitizer.clean("   \n\t"), PLACEHOLDER);
        assert_eq!(sanitizer.clean(None), PLACEHOLDER);
    }

    #[test]
    fn strips_role_prefixes_at_line_start_and_inline() {
        assert_eq!(clean("Misaki: hello there"), "hello there");
        assert_eq!(clean("first line\nuser: second"), "first line second");
        assert_eq!(clean("she said misaki: fine"), "she said fine");
    }

    #[test]
    fn strips_markdown_and_code_fences() {
        assert_eq!(clean("**bold** and _it_"), "bold and it");
        assert_eq!(clean("before ```let x = 1;``` after"), "before after");
        assert_eq!(clean("# Title\n> quote"), "Title quote");
    }

    #[test]
    fn strips_stage_directions() {
        assert_eq!(clean("[sighs] fine (quietly) whatever"), "fine whatever");
    }

    #[test]
    fn strips_emoji_and_invisible_controls() {
        assert_eq!(clean("hi 😀 there\u{FE0F}\u{200D}\u{2067}"), "hi there");
    }

    #[test]
    fn strips_enclosing_quote_runs() {
        assert_eq!(clean("\"hello\""), "hello");
        assert_eq!(clean("\u{201C}\u{2018}hello\u{2019}\u{201D}"), "hello");
        assert_eq!(clean("it's fine"), "it's fine");
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let raw = "word ".repeat(100);
        let cleaned = clean(&raw);
        assert!(cleaned.ends_with("..."));
        assert!(utf16_len(&cleaned) <= MAX_DISPLAY_UNITS + 3);
    }

    #[test]
    fn truncation_counts_utf16_units() {
        // Each astral-plane letter is two UTF-16 units.
        let raw = "\u{1D400}".repeat(200);
        let cleaned = clean(&raw);
        assert_eq!(utf16_len(&cleaned), MAX_DISPLAY_UNITS + 3);
    }

    #[test]
    fn generated_inputs_stay_non_empty_and_bounded() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const FRAGMENTS: &[&str] = &[
            "あ", "漢字", "😀", "👩\u{200D}💻", "\u{1D400}", "a", "word ", ". ", "! ",
            "\"", "\u{201C}", "'", "<|user|>", "</s>", "<|assistant|>", "<<END>>",
            "Misaki: ", "User:", "**", "```", "(sighs)", "[", "]", "\n", "\t",
            "\u{FE0F}", "\u{200B}", "...", "# ", "> ",
        ];

        let sanitizer = Sanitizer::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut inputs: Vec<String> = vec![
            "あ".repeat(400),
            "😀".repeat(300),
            "<|user|></s><|assistant|>".repeat(20),
            "\"\u{201C}\u{2018}".repeat(50),
            "x".repeat(1000),
            "😀a".repeat(150),
            "...".repeat(100),
        ];
        for _ in 0..500 {
            let pieces = rng.gen_range(0..300);
            inputs.push(
                (0..pieces)
                    .map(|_| FRAGMENTS[rng.gen_range(0..FRAGMENTS.len())])
                    .collect(),
            );
        }

        for raw in &inputs {
            let cleaned = sanitizer.clean(raw.as_str());
            assert!(!cleaned.is_empty(), "empty output for {raw:?}");
            assert!(
                utf16_len(&cleaned) <= MAX_DISPLAY_UNITS + 3,
                "{} units for {raw:?}",
                utf16_len(&cleaned)
            );
        }
    }

    #[test]
    fn clean_is_idempotent_on_plain_text() {
        let samples = [
            "just a plain reply.".to_owned(),
            "\"quoted\" reply".to_owned(),
            "x".repeat(300),
            "ab ".repeat(120),
            "...".to_owned(),
        ];
        for raw in samples {
            let once = clean(&raw);
            assert_eq!(clean(&once), once, "not a fixed point for {raw:?}");
        }
    }

    #[test]
    fn custom_role_names_are_respected() {
        let sanitizer = Sanitizer::new(["Kiri"]);
        assert_eq!(sanitizer.clean("Kiri: hm"), "hm");
        assert_eq!(sanitizer.clean("Misaki: hm"), "Misaki: hm");
    }

    #[test]
    fn two_sentence_cap_drops_the_third() {
        assert_eq!(cap_sentences("A. B. C."), "A. B.");
        assert_eq!(cap_sentences("Really? Yes! No."), "Really? Yes!");
        assert_eq!(cap_sentences("one sentence only"), "one sentence only");
        assert_eq!(cap_sentences("It's... a lot."), "It's... a lot.");
    }

    #[test]
    fn empty_sentence_cap_yields_filler() {
        assert_eq!(cap_sentences(""), FILLER);
        assert_eq!(cap_sentences("   "), FILLER);
    }

    #[test]
    fn extracts_text_after_last_assistant_tag() {
        let raw = "<|user|>\nhi</s>\n<|assistant|>\nold</s>\n<|user|>\nnow </s>\n<|assistant|>\nHello there</s>junk";
        assert_eq!(extract_assistant_reply(raw, &["</s"]), "Hello there");
    }

    #[test]
    fn extraction_uses_earliest_stop_marker() {
        let raw = "Hello<<END>> later <|user|>";
        assert_eq!(extract_assistant_reply(raw, &["<|user|>", "<<END>>"]), "Hello");
    }

    #[test]
    fn extraction_strips_leading_fragments() {
        assert_eq!(extract_assistant_reply("|>\n assistant: hi", &["<|user|>"]), "hi");
        assert_eq!(extract_assistant_reply("</s> hey", &["<|user|>"]), "hey");
    }
}
