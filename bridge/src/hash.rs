//! Content fingerprints used as cache and task keys.
//!
//! Only meant to avoid accidental collisions between cache entries. Do not
//! use these digests for anything security sensitive.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Digest used to fingerprint content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 rendered as 64 lowercase hex characters (default)
    #[default]
    Sha256,

    /// 32-bit multiplicative hash, for targets without a SHA-256 implementation.
    /// Output is unpadded hex, so its length varies.
    Djb2,
}

/// Which inputs participate in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Hash only the text; context is ignored (default, matches plain content hashes)
    #[default]
    TextOnly,

    /// Hash context (model, provider) together with the text
    WithContext,
}

/// Separates context from text so `("a", "b:c")` and `("a:b", "c")` never meet.
const CONTEXT_SEPARATOR: char = '\u{1f}';

/// Deterministic content hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
    strategy: KeyStrategy,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm, strategy: KeyStrategy) -> Self {
        Self {
            algorithm,
            strategy,
        }
    }

    /// Hasher that mixes context into every key.
    pub fn with_context() -> Self {
        Self::new(HashAlgorithm::Sha256, KeyStrategy::WithContext)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Fingerprint `text`, optionally qualified by `context`.
    pub fn hash(&self, text: &str, context: Option<&str>) -> String {
        match (self.strategy, context) {
            (KeyStrategy::WithContext, Some(ctx)) => {
                let input = format!("{}{}{}", ctx, CONTEXT_SEPARATOR, text);
                self.digest(&input)
            }
            _ => self.digest(text),
        }
    }

    fn digest(&self, input: &str) -> String {
        match self.algorithm {
            HashAlgorithm::Sha256 => sha256_hex(input),
            HashAlgorithm::Djb2 => djb2_hex(input),
        }
    }
}

/// SHA-256 of `text` as lowercase hex.
pub fn hash_text(text: &str) -> String {
    sha256_hex(text)
}

/// First 12 characters of a hash, for log lines.
pub fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(12) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn djb2_hex(input: &str) -> String {
    let hash = input
        .encode_utf16()
        .fold(5381u32, |h, unit| h.wrapping_mul(33) ^ u32::from(unit));
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hello_is_64_hex_chars_and_stable() {
        let hasher = ContentHasher::default();
        let a = hasher.hash("hello", None);
        let b = hasher.hash("hello", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_text_only_ignores_context() {
        let hasher = ContentHasher::default();
        assert_eq!(
            hasher.hash("hello", Some("ollama/qwen2.5:7b")),
            hash_text("hello")
        );
    }

    #[test]
    fn test_context_changes_key() {
        let hasher = ContentHasher::with_context();
        let a = hasher.hash("hello", Some("ollama/qwen2.5:7b"));
        let b = hasher.hash("hello", Some("openai/gpt-4o-mini"));
        assert_ne!(a, b);
        assert_ne!(a, hasher.hash("hello", None));
    }

    #[test]
    fn test_separator_prevents_boundary_collisions() {
        let hasher = ContentHasher::with_context();
        assert_ne!(hasher.hash("b:c", Some("a")), hasher.hash("c", Some("a:b")));
    }

    #[test]
    fn test_djb2_fallback() {
        let hasher = ContentHasher::new(HashAlgorithm::Djb2, KeyStrategy::TextOnly);
        let a = hasher.hash("hello", None);
        assert_eq!(a, hasher.hash("hello", None));
        assert!(a.len() <= 8);
        assert_ne!(a, hasher.hash("hellp", None));
        // djb2-xor of the empty string is the seed itself
        assert_eq!(hasher.hash("", None), format!("{:x}", 5381));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash(&hash_text("hello")), "2cf24dba5fb0");
        assert_eq!(short_hash("abc"), "abc");
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(s in ".*", c in ".*") {
            let hasher = ContentHasher::with_context();
            prop_assert_eq!(hasher.hash(&s, Some(&c)), hasher.hash(&s, Some(&c)));
        }

        #[test]
        fn prop_distinct_contexts_distinct_keys(s in ".*", c1 in "[a-z]{1,12}", c2 in "[a-z]{1,12}") {
            prop_assume!(c1 != c2);
            let hasher = ContentHasher::with_context();
            prop_assert_ne!(hasher.hash(&s, Some(&c1)), hasher.hash(&s, Some(&c2)));
        }
    }
}
