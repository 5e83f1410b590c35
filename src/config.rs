//! Relay configuration.
//!
//! Every component reads its own section of [`RelayConfig`]. Durations are
//! written in milliseconds in YAML files (`window_ms: 15000`) and can be
//! overridden from `RELAY_*` environment variables.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What to do when a bounded buffer or queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new item with [`Error::Capacity`].
    #[default]
    Reject,
    /// Discard the oldest item to make room.
    DropOldest,
}

/// Which entry the response cache evicts when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Earliest inserted entry goes first; reads do not change the order.
    #[default]
    Fifo,
    /// Least recently read or written entry goes first.
    Lru,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    #[serde(rename = "window_ms", with = "millis")]
    pub window: Duration,
    /// `None` keeps per-sender buffers unbounded.
    pub max_fragments: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15),
            max_fragments: None,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl DebounceConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
    pub fn with_max_fragments(mut self, max: usize, overflow: OverflowPolicy) -> Self {
        self.max_fragments = Some(max.max(1));
        self.overflow = overflow;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries granted to a unit after its first failed attempt. A unit that
    /// still fails once these are used up is reported as exhausted.
    pub max_retries: u32,
    /// Linear backoff step: a unit waits `retry_delay * retry_count` before re-entering the queue.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    /// `None` keeps the queue unbounded.
    pub max_len: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_len: None,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
    pub fn with_max_len(mut self, max: usize, overflow: OverflowPolicy) -> Self {
        self.max_len = Some(max.max(1));
        self.overflow = overflow;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,
    pub capacity: usize,
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30 * 60),
            capacity: 1000,
            sweep_interval: Duration::from_secs(5 * 60),
            eviction: EvictionPolicy::Fifo,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub factor: f64,
    #[serde(rename = "initial_timeout_ms", with = "millis")]
    pub initial_timeout: Duration,
    #[serde(rename = "max_timeout_ms", with = "millis")]
    pub max_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            initial_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_attempts(mut self, n: u32) -> Self {
        self.attempts = n.max(1);
        self
    }
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }
    pub fn with_timeouts(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_timeout = initial;
        self.max_timeout = max.max(initial);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Collapse turns older than the history window into one system line.
    pub summarize_history: bool,
    /// Upper bound on the summary line length, in characters.
    pub summary_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            summarize_history: false,
            summary_chars: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Keyring service entry and `<ID>_API_KEY` env var prefix.
    pub provider_id: String,
    pub base_url: String,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_id: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            referer: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Maximum characters per delivered chunk. `0` disables chunking.
    pub chunk_chars: usize,
    #[serde(rename = "chunk_delay_ms", with = "millis")]
    pub chunk_delay: Duration,
    /// Turns loaded from the conversation store per unit.
    pub history_limit: usize,
    /// Sent to the user when generation fails; never carries error detail.
    pub fallback_message: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            chunk_chars: 180,
            chunk_delay: Duration::from_millis(800),
            history_limit: 50,
            fallback_message: "Estou tendo dificuldades técnicas. Por favor, tente novamente."
                .to_string(),
        }
    }
}

impl ReplyConfig {
    pub fn with_chunking(mut self, chars: usize, delay: Duration) -> Self {
        self.chunk_chars = chars;
        self.chunk_delay = delay;
        self
    }
}

/// Top-level configuration for a [`crate::Relay`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub debounce: DebounceConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub generation: GenerationConfig,
    pub provider: ProviderConfig,
    pub reply: ReplyConfig,
}

impl RelayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Apply `RELAY_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are ignored.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(d) = millis("RELAY_DEBOUNCE_MS") {
            self.debounce.window = d;
        }
        if let Some(n) = number("RELAY_QUEUE_MAX_RETRIES") {
            self.queue.max_retries = n as u32;
        }
        if let Some(d) = millis("RELAY_QUEUE_RETRY_DELAY_MS") {
            self.queue.retry_delay = d;
        }
        if let Some(d) = millis("RELAY_CACHE_TTL_MS") {
            self.cache.ttl = d;
        }
        if let Some(n) = number("RELAY_CACHE_CAPACITY") {
            self.cache.capacity = n as usize;
        }
        if let Some(n) = number("RELAY_RETRY_ATTEMPTS") {
            self.retry.attempts = n as u32;
        }
        if let Some(d) = millis("RELAY_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay = d;
        }
        if let Some(url) = lookup("RELAY_PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("relay_config"),
            ))
        };
        if self.debounce.window.is_zero() {
            return invalid("debounce.window_ms", "debounce window must be positive");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity", "cache capacity must be positive");
        }
        if self.cache.enabled && self.cache.sweep_interval.is_zero() {
            return invalid("cache.sweep_interval_ms", "cache sweep interval must be positive");
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts", "at least one provider attempt is required");
        }
        if self.retry.factor.is_nan() || self.retry.factor < 1.0 {
            return invalid("retry.factor", "backoff factor must be >= 1.0");
        }
        if url::Url::parse(&self.provider.base_url).is_err() {
            return invalid("provider.base_url", "provider base URL is not a valid URL");
        }
        Ok(())
    }
}
