//! Response caching.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TtlCache`] | Expiring store with capacity eviction and a periodic sweep |
//! | [`ResponseCache`] | `TtlCache` keyed by request fingerprint, holding reply text |
//! | [`CacheKey`] | Fingerprint of (normalized text, history length, persona, model) |
//!
//! ```rust
//! use chat_relay::cache::{CacheKey, ResponseCache};
//! use chat_relay::config::CacheConfig;
//!
//! let cache = ResponseCache::new(CacheConfig::default());
//! let key = CacheKey::fingerprint("oi", 0, "default", "deepseek/deepseek-chat");
//! cache.set(key.clone(), "Fala! Em que posso te ajudar?".to_string());
//! assert!(cache.get(&key).is_some());
//! ```

mod key;
mod store;

pub use key::{normalize_text, CacheKey};
pub use store::{CacheStats, TtlCache};

/// Cache of generated replies.
pub type ResponseCache = TtlCache<CacheKey, String>;
