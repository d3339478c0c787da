//! Content hashing and text shaping for embedding input.
//!
//! Cache keys are the SHA-256 of the exact UTF-8 bytes handed to the cache:
//! [`content_hash_hex`] does no normalization of its own, so two strings that
//! differ in a single byte never share a vector. Normalization happens once,
//! upstream, when field text is synthesized by [`field_text`]:
//!
//! 1. **Unicode NFC normalization** - "café" (decomposed) → "café" (composed)
//! 2. **Whitespace normalization** - collapse runs, trim
//! 3. **Truncation** - limit to [`MAX_EMBED_CHARS`]
//!
//! so the same visual field always produces the same key.

use ring::digest::{self, SHA256};
use unicode_normalization::UnicodeNormalization;

/// Maximum characters kept in synthesized field text.
pub const MAX_EMBED_CHARS: usize = 2000;

/// Maximum characters in a search hit snippet.
pub const MAX_SNIPPET_CHARS: usize = 200;

/// Compute SHA256 content hash of text (exact bytes).
pub fn content_hash(text: &str) -> [u8; 32] {
    let digest = digest::digest(&SHA256, text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(digest.as_ref());
    hash
}

/// Hex form of [`content_hash`], used as the persisted cache key.
pub fn content_hash_hex(text: &str) -> String {
    hex::encode(content_hash(text))
}

/// NFC-normalize, collapse whitespace and truncate.
pub fn canonicalize(text: &str) -> String {
    let normalized: String = text.nfc().collect();
    truncate_to_chars(&normalize_whitespace(&normalized), MAX_EMBED_CHARS)
}

/// Text indexed for one field instance: `"{field_key}: {field_value}"`.
pub fn field_text(field_key: &str, value: &str) -> String {
    let key = canonicalize(field_key);
    let value = canonicalize(value);
    if key.is_empty() {
        value
    } else {
        canonicalize(&format!("{key}: {value}"))
    }
}

/// Snippet of at most [`MAX_SNIPPET_CHARS`] characters, ending in `...` when cut.
pub fn snippet(text: &str) -> String {
    snippet_with_limit(text, MAX_SNIPPET_CHARS)
}

pub fn snippet_with_limit(text: &str, max_chars: usize) -> String {
    let clean = normalize_whitespace(text);
    if clean.chars().count() <= max_chars {
        return clean;
    }
    if max_chars <= 3 {
        return truncate_to_chars(&clean, max_chars);
    }
    let mut cut = truncate_to_chars(&clean, max_chars - 3);
    cut.truncate(cut.trim_end().len());
    cut.push_str("...");
    cut
}

/// Normalize whitespace: collapse runs, trim.
pub fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_whitespace = true; // Start as true to trim leading

    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_whitespace {
                result.push(' ');
                prev_whitespace = true;
            }
        } else {
            result.push(c);
            prev_whitespace = false;
        }
    }

    result.trim_end().to_string()
}

/// Truncate string to at most N characters, respecting char boundaries.
fn truncate_to_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
