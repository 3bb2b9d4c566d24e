//! Text normalization shared by parsers and dedup keys.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Trim and collapse every whitespace run to a single space.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decompose and drop combining marks: "Ação" -> "Acao".
pub fn strip_diacritics(input: &str) -> String {
    input.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// Comparison form: upper-cased, diacritics stripped, whitespace collapsed.
pub fn normalize_key(input: &str) -> String {
    clean_text(&strip_diacritics(&input.to_uppercase()))
}
