//! Prompt clean-up applied before tokenization, so prompts look like the
//! captions the generator was trained on.
use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(https?://|www\.)\S+").unwrap());
static WIKI_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").unwrap());
static NUMBER_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d),(\d)").unwrap());
static WORD_HYPHEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w)-(\w)").unwrap());
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[()\[\].,|:;?!=+~\-/{}]").unwrap());
static COMMA_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*,[\s,]*").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const ENTITIES: &[(&str, &str)] = &[
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&nbsp;", " "),
    ("&amp;", "&"),
];

fn simplify_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{2032}' | '`' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{2033}' => '"',
            c => c,
        })
        .collect()
}

fn unescape_html(text: &str) -> String {
    ENTITIES
        .iter()
        .fold(text.to_string(), |acc, (entity, plain)| acc.replace(entity, plain))
}

/// Normalizes a prompt: quotes, HTML, URLs, punctuation and whitespace are
/// folded into a lowercase, comma-separated caption.
pub fn normalize(text: &str) -> String {
    let text = simplify_quotes(text);
    let text = HTML_TAG.replace_all(&text, " ");
    let text = unescape_html(&text).to_lowercase();
    let text = URL.replace_all(&text, " ");
    let text = WIKI_REF.replace_all(&text, "");
    let text = NUMBER_COMMA.replace_all(&text, "$1$2");
    // Two passes so overlapping matches like "1,000,000" collapse fully.
    let text = NUMBER_COMMA.replace_all(&text, "$1$2");
    let text = WORD_HYPHEN.replace_all(&text, "$1 $2");
    let text = PUNCTUATION.replace_all(&text, ",");
    let text = COMMA_RUN.replace_all(&text, ", ");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_trims() {
        assert_eq!(normalize("  Sunset Over A Lake  "), "sunset over a lake");
    }

    #[test]
    fn strips_markup_and_entities() {
        assert_eq!(
            normalize("A <b>Cat</b>&amp;dog on the moon!!!"),
            "a cat &dog on the moon"
        );
    }

    #[test]
    fn punctuation_becomes_single_commas() {
        assert_eq!(
            normalize("the eiffel tower; landing... on the moon?"),
            "the eiffel tower, landing, on the moon"
        );
    }

    #[test]
    fn urls_and_references_are_dropped() {
        assert_eq!(
            normalize("a painting[12] see https://example.com/x for more"),
            "a painting see for more"
        );
    }

    #[test]
    fn numbers_keep_their_digits() {
        assert_eq!(normalize("1,000,000 stars"), "1000000 stars");
    }

    #[test]
    fn hyphenated_words_are_split() {
        assert_eq!(normalize("a half-eaten “apple”"), "a half eaten \"apple\"");
    }

    #[test]
    fn empty_prompt_stays_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" ... "), "");
    }
}
