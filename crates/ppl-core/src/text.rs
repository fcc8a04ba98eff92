// SPDX-License-Identifier: MIT OR Apache-2.0
//! Text canonicalisation, token estimation, and canonical stringification.

use unicode_normalization::UnicodeNormalization;

/// Default multiplier applied to the whitespace word count when estimating
/// tokens.
pub const DEFAULT_TOKEN_MULTIPLIER: f64 = 1.3;

/// Canonicalise text for hashing and chunking: Unicode NFC, line endings
/// normalised to LF.
///
/// Content-bearing whitespace is preserved; no per-line trimming happens
/// here.
pub fn canonicalize_text(input: &str) -> String {
    let normalized: String = input.nfc().collect();
    // CRLF first so lone CR handling cannot double-convert.
    normalized.replace("\r\n", "\n").replace('\r', "\n")
}

/// Fast, approximate token estimate: whitespace-split word count times the
/// configured multiplier, rounded up. Deliberately cheap; not a tokenizer.
pub fn estimate_tokens(text: &str, multiplier: f64) -> u32 {
    let words = text.split_whitespace().count();
    (words as f64 * multiplier).ceil() as u32
}

/// Canonical stringification of a scope value: scalars verbatim, containers
/// as compact JSON.
pub fn canonical_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crlf_and_cr_become_lf() {
        assert_eq!(canonicalize_text("a\r\nb\rc\n"), "a\nb\nc\n");
    }

    #[test]
    fn nfc_applied() {
        // e + combining acute composes to U+00E9.
        let decomposed = "e\u{0301}";
        assert_eq!(canonicalize_text(decomposed), "\u{00e9}");
    }

    #[test]
    fn trailing_whitespace_preserved() {
        assert_eq!(canonicalize_text("a  \nb"), "a  \nb");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("one two three", 1.3), 4);
        assert_eq!(estimate_tokens("", 1.3), 0);
        assert_eq!(estimate_tokens("word", 1.0), 1);
    }

    #[test]
    fn canonical_scalars_verbatim() {
        assert_eq!(canonical_string(&json!("plain")), "plain");
        assert_eq!(canonical_string(&json!(42)), "42");
        assert_eq!(canonical_string(&json!(true)), "true");
        assert_eq!(canonical_string(&json!(null)), "");
    }

    #[test]
    fn canonical_containers_compact_json() {
        assert_eq!(canonical_string(&json!([1, 2])), "[1,2]");
        assert_eq!(canonical_string(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
