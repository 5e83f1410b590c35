//! Message ingestion and dispatch.
//!
//! ```text
//! transport ─▶ DebounceBuffer::submit ─(window idle)─▶ DispatchQueue::enqueue
//!                                                          │ one unit at a time
//!                                                          ▼
//!                                     MessageHandler: history ▶ middleware ▶ generate
//!                                                          │
//!                                                          ▼
//!                                        ChatTransport::send_text (chunked)
//! ```

mod builder;
pub mod debounce;
pub mod handler;
pub mod ports;
pub mod queue;

pub use builder::RelayBuilder;
pub use debounce::DebounceBuffer;
pub use handler::{split_reply, MessageHandler};
pub use ports::{ChatTransport, ConversationStore, InMemoryConversationStore};
pub use queue::{DeliveryProgress, DispatchFailure, DispatchQueue, DispatchUnit, QueueStats, UnitHandler};

use crate::cache::{CacheStats, ResponseCache};
use crate::config::RelayConfig;
use crate::plugins::{HookEngine, PluginStats};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Snapshot for dashboards and the operator console.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub pending_senders: usize,
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub plugins: PluginStats,
}

/// A running relay. Build one with [`RelayBuilder`].
pub struct Relay {
    pub(crate) config: RelayConfig,
    pub(crate) debounce: DebounceBuffer,
    pub(crate) queue: DispatchQueue,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) hooks: Arc<HookEngine>,
    pub(crate) sweeper: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Accept one inbound fragment from the transport.
    pub fn submit(&self, sender_id: &str, text: impl Into<String>) -> Result<()> {
        self.debounce.submit(sender_id, text)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn hooks(&self) -> &Arc<HookEngine> {
        &self.hooks
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_senders(&self) -> usize {
        self.debounce.pending_senders()
    }

    /// Flush one sender's buffer without waiting for the window.
    pub fn flush_now(&self, sender_id: &str) -> bool {
        self.debounce.flush_now(sender_id)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            pending_senders: self.debounce.pending_senders(),
            queue: self.queue.stats(),
            cache: self.cache.stats(),
            plugins: self.hooks.stats(),
        }
    }

    /// Stop the flush timers and the cache sweeper.
    ///
    /// Units already queued keep draining; buffered fragments are discarded.
    pub fn shutdown(&mut self) {
        let discarded = self.debounce.shutdown();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        info!(discarded, queued = self.queue.len(), "relay shut down");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
