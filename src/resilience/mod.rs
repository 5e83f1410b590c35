//! Retry primitives for calls to the generation provider.
//!
//! [`RetryExecutor`] runs an attempt function up to `attempts` times,
//! sleeping `base_delay * factor^attempt` between attempts while the
//! predicate allows it. [`RetryPolicy::attempt_timeout`] gives later
//! attempts more time, so a slow but alive provider can still answer.
//!
//! ```rust
//! use chat_relay::resilience::{RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default()
//!     .with_attempts(3)
//!     .with_backoff(Duration::from_millis(500), 2.0);
//! let executor = RetryExecutor::new(policy);
//! assert_eq!(executor.policy().backoff(1), Duration::from_millis(1000));
//! ```

pub mod retry;

pub use retry::{with_attempt_timeout, RetryExecutor, RetryPolicy};
