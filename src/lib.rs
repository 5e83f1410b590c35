//! # chat-relay
//!
//! In-process core of a conversational relay: coalesce bursts of chat
//! fragments per sender, dispatch them one at a time, and answer each with a
//! generated reply behind a plugin chain, a response cache and retries.
//!
//! ## Overview
//!
//! The transport hands every inbound `(sender, text)` to [`Relay::submit`].
//! Fragments from one sender are buffered until the sender has been idle for
//! the debounce window, then joined into a single [`relay::DispatchUnit`].
//! The dispatch queue handles units strictly in order; each unit loads the
//! sender's recent history, runs through the middleware chain and the
//! [`client::GenerationClient`], and the reply goes back through the
//! transport in short chunks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use chat_relay::relay::ChatTransport;
//! use chat_relay::{RelayBuilder, RelayConfig};
//! use std::sync::Arc;
//!
//! struct Stdout;
//!
//! #[async_trait]
//! impl ChatTransport for Stdout {
//!     async fn send_text(&self, sender_id: &str, text: &str) -> chat_relay::Result<()> {
//!         println!("{} <- {}", sender_id, text);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> chat_relay::Result<()> {
//!     let config = RelayConfig::default().apply_env()?;
//!     let (relay, mut failures) = RelayBuilder::new()
//!         .with_config(config)
//!         .with_transport(Arc::new(Stdout))
//!         .build()?;
//!
//!     relay.submit("5554@c.us", "Oi")?;
//!     relay.submit("5554@c.us", "tudo bem?")?;
//!
//!     while let Some(failure) = failures.recv().await {
//!         eprintln!("gave up on {}: {}", failure.unit.sender_id, failure.error);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`relay`] | Debounce buffer, dispatch queue, message handler, [`Relay`] facade |
//! | [`client`] | Provider trait and HTTP provider, persona resolver, generation client |
//! | [`plugins`] | Hook and middleware engine, built-in plugins |
//! | [`cache`] | TTL response cache with capacity eviction |
//! | [`resilience`] | Retry executor with exponential backoff and per-attempt timeouts |
//! | [`config`] | Configuration structs, YAML loading, env overrides |
//! | [`types`] | Chat messages |

pub mod cache;
pub mod client;
pub mod config;
pub mod plugins;
pub mod relay;
pub mod resilience;
pub mod types;

pub use config::RelayConfig;
pub use relay::{Relay, RelayBuilder, RelayStats};
pub use types::{InboundMessage, Message, MessageRole};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
