use super::debounce::DebounceBuffer;
use super::handler::MessageHandler;
use super::ports::{ChatTransport, ConversationStore, InMemoryConversationStore};
use super::queue::{DispatchFailure, DispatchQueue};
use super::Relay;
use crate::cache::ResponseCache;
use crate::client::{ConfigResolver, GenerationClient, HttpProvider, PersonaResolver, Provider};
use crate::config::RelayConfig;
use crate::plugins::HookEngine;
use crate::resilience::{RetryExecutor, RetryPolicy};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Builder for a [`Relay`].
///
/// Only the transport is mandatory. Defaults: [`HttpProvider`] configured
/// from `config.provider` (key from keyring or env), [`PersonaResolver`] with
/// the built-in personas, [`InMemoryConversationStore`], and an empty
/// [`HookEngine`].
pub struct RelayBuilder {
    config: RelayConfig,
    hooks: Option<Arc<HookEngine>>,
    resolver: Option<Arc<dyn ConfigResolver>>,
    provider: Option<Arc<dyn Provider>>,
    store: Option<Arc<dyn ConversationStore>>,
    transport: Option<Arc<dyn ChatTransport>>,
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            hooks: None,
            resolver: None,
            provider: None,
            store: None,
            transport: None,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a hook engine with the operator surface.
    pub fn with_hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConfigResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Wire everything together and start the cache sweeper.
    ///
    /// Returns the relay and the receiving end of the dispatch failure
    /// channel. Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<(Relay, mpsc::UnboundedReceiver<DispatchFailure>)> {
        let config = self.config;
        config.validate()?;

        let transport = self.transport.ok_or_else(|| {
            Error::configuration_with_context(
                "a chat transport is required",
                ErrorContext::new()
                    .with_field_path("transport")
                    .with_source("relay_builder"),
            )
        })?;
        let provider: Arc<dyn Provider> = match self.provider {
            Some(p) => p,
            None => Arc::new(HttpProvider::from_config(&config.provider)?),
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(PersonaResolver::with_defaults()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new()));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(HookEngine::new()));

        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let sweeper = config.cache.enabled.then(|| cache.spawn_sweeper());

        let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));
        let client = Arc::new(
            GenerationClient::new(provider.clone(), resolver, hooks.clone(), cache.clone(), retry)
                .with_config(config.generation.clone()),
        );
        let handler = Arc::new(MessageHandler::new(
            client,
            hooks.clone(),
            store,
            transport,
            config.reply.clone(),
        ));
        let (queue, failures) = DispatchQueue::new(config.queue.clone(), handler);
        let debounce = DebounceBuffer::new(config.debounce.clone(), queue.clone());

        info!(
            provider = provider.name(),
            window_ms = config.debounce.window.as_millis() as u64,
            max_retries = config.queue.max_retries,
            cache_capacity = config.cache.capacity,
            "relay ready"
        );
        Ok((
            Relay {
                config,
                debounce,
                queue,
                cache,
                hooks,
                sweeper,
            },
            failures,
        ))
    }
}
