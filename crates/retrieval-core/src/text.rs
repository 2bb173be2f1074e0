//! Lexical tokenizer.
//!
//! Lowercases and splits on anything that is not alphanumeric, which
//! matches how SQLite's `unicode61` FTS5 tokenizer segments ASCII text.

/// Split text into lowercase alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
