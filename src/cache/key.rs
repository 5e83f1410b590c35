//! Cache key generation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Fingerprint of a generation request.
///
/// Two requests share a key when the normalized user text, the length of
/// the history that would be sent, the persona and the model all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    /// Build the fingerprint for a generation request.
    pub fn fingerprint(user_text: &str, history_len: usize, persona: &str, model: &str) -> Self {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("text", normalize_text(user_text));
        parts.insert("history_len", history_len.to_string());
        parts.insert("persona", persona.to_string());
        parts.insert("model", model.to_string());

        let mut hasher = Sha256::new();
        for (k, v) in &parts {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        Self { hash }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// Lowercase, trim, and collapse inner whitespace runs to one space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
