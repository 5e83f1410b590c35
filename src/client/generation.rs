//! Generation client: hooks, cache and retry around the provider call.

use super::provider::{ModelParams, Provider};
use super::resolver::{ConfigResolver, ResolvedConfig};
use crate::cache::{CacheKey, ResponseCache};
use crate::config::GenerationConfig;
use crate::plugins::{HookEngine, HookEvent, PipelineContext};
use crate::resilience::{with_attempt_timeout, RetryExecutor};
use crate::types::Message;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces a reply for one user message.
///
/// Order of operations: resolve settings, `beforeMessage` hooks (which may
/// answer directly), cache lookup, provider call under retry, `afterMessage`
/// hooks, cache store, `messageProcessed` hooks.
pub struct GenerationClient {
    provider: Arc<dyn Provider>,
    resolver: Arc<dyn ConfigResolver>,
    hooks: Arc<HookEngine>,
    cache: Arc<ResponseCache>,
    retry: RetryExecutor,
    config: GenerationConfig,
}

impl GenerationClient {
    pub fn new(
        provider: Arc<dyn Provider>,
        resolver: Arc<dyn ConfigResolver>,
        hooks: Arc<HookEngine>,
        cache: Arc<ResponseCache>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            provider,
            resolver,
            hooks,
            cache,
            retry,
            config: GenerationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn hooks(&self) -> &Arc<HookEngine> {
        &self.hooks
    }

    pub async fn generate(
        &self,
        history: &[Message],
        user_text: &str,
        user_id: Option<&str>,
    ) -> Result<String> {
        let config = self.resolver.resolve_config(user_id).await?;

        let ctx = PipelineContext::new(user_text, history.to_vec(), config.clone())
            .with_user_id(user_id.map(str::to_string));
        let ctx = self.hooks.run_hooks(&HookEvent::BeforeMessage, ctx).await;
        if let Some(auto) = ctx.auto_response {
            info!(user_id = ?user_id, "answered by beforeMessage hook");
            return Ok(auto);
        }

        let window = history.len().min(config.history_window);
        let key = CacheKey::fingerprint(user_text, window, &config.persona_id, &config.model);
        if let Some(cached) = self.cache.get(&key) {
            debug!(key = %key, "cache hit");
            return Ok(cached);
        }

        let messages = build_messages(&config, history, user_text, &self.config);
        let params = ModelParams {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.token_budget,
        };
        let raw = self.call_provider(&messages, &params, &config).await?;

        let ctx = self
            .hooks
            .run_hooks(&HookEvent::AfterMessage, ctx.with_response(raw.clone()))
            .await;
        let response = ctx.response.clone().unwrap_or(raw);

        self.cache.set(key, response.clone());
        self.hooks
            .run_hooks(
                &HookEvent::MessageProcessed,
                ctx.with_response(response.clone()),
            )
            .await;
        Ok(response)
    }

    async fn call_provider(
        &self,
        messages: &[Message],
        params: &ModelParams,
        config: &ResolvedConfig,
    ) -> Result<String> {
        let provider = &self.provider;
        let policy = self.retry.policy();
        let attempts = policy.attempts;
        self.retry
            .execute_with(
                |attempt| async move {
                    info!(
                        attempt = attempt + 1,
                        attempts,
                        persona = %config.persona_id,
                        model = %params.model,
                        history = messages.len(),
                        "calling provider"
                    );
                    let timeout = policy.attempt_timeout(attempt);
                    with_attempt_timeout(
                        policy,
                        attempt,
                        provider.complete(messages, params, timeout),
                    )
                    .await
                },
                |err, _| err.is_retryable(),
                |err, attempt| {
                    warn!(
                        attempt = attempt + 1,
                        provider = provider.name(),
                        model = %params.model,
                        error = %err,
                        "provider attempt failed"
                    );
                },
            )
            .await
    }
}

/// Assemble the provider message list: system prompt, optional summary of
/// turns outside the history window, the windowed history, then the user text.
/// Turns with empty content are dropped.
pub fn build_messages(
    config: &ResolvedConfig,
    history: &[Message],
    user_text: &str,
    generation: &GenerationConfig,
) -> Vec<Message> {
    let split = history.len().saturating_sub(config.history_window);
    let (older, recent) = history.split_at(split);

    let mut messages = Vec::with_capacity(recent.len() + 3);
    messages.push(Message::system(config.system_prompt.clone()));
    if generation.summarize_history && !older.is_empty() {
        if let Some(summary) = summarize(older, generation.summary_chars) {
            messages.push(Message::system(summary));
        }
    }
    messages.extend(
        recent
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .cloned(),
    );
    messages.push(Message::user(user_text));
    messages
}

fn summarize(older: &[Message], max_chars: usize) -> Option<String> {
    let joined = older
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role, m.content.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect::<Vec<_>>()
        .join(" | ");
    if joined.is_empty() {
        return None;
    }
    let mut body: String = joined.chars().take(max_chars).collect();
    if body.len() < joined.len() {
        body.push('…');
    }
    Some(format!(
        "Resumo de {} mensagens anteriores: {}",
        older.len(),
        body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StaticResolver;
    use crate::config::{CacheConfig, RetryConfig};
    use crate::plugins::fn_hook;
    use crate::resilience::RetryPolicy;
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProvider {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, messages: &[Message], _: &ModelParams, _: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok("default reply".to_string())
            } else {
                script.remove(0)
            }
        }
    }

    fn resolved() -> ResolvedConfig {
        ResolvedConfig {
            persona_id: "default".to_string(),
            model: "deepseek/deepseek-chat".to_string(),
            temperature: 0.7,
            token_budget: 800,
            system_prompt: "sys".to_string(),
            history_window: 2,
        }
    }

    fn client(provider: Arc<ScriptedProvider>, hooks: Arc<HookEngine>) -> GenerationClient {
        let policy = RetryPolicy::from_config(
            &RetryConfig::default().with_base_delay(Duration::from_millis(10)),
        );
        GenerationClient::new(
            provider,
            Arc::new(StaticResolver::new(resolved())),
            hooks,
            Arc::new(ResponseCache::new(CacheConfig::default())),
            RetryExecutor::new(policy),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_identical_request_hits_cache() {
        let provider = ScriptedProvider::new(vec![Ok("primeira".to_string())]);
        let c = client(provider.clone(), Arc::new(HookEngine::new()));
        let history = vec![Message::user("a"), Message::assistant("b")];

        let first = c.generate(&history, "tudo bem?", Some("u1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = c.generate(&history, "tudo bem?", Some("u1")).await.unwrap();

        assert_eq!(first, "primeira");
        assert_eq!(second, "primeira");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_circuit_skips_cache_provider_and_after_hooks() {
        let provider = ScriptedProvider::new(vec![]);
        let hooks = Arc::new(HookEngine::new());
        let after_calls = Arc::new(AtomicUsize::new(0));
        let counter = after_calls.clone();
        hooks.register_hooks(
            "quick",
            vec![
                (
                    HookEvent::BeforeMessage,
                    fn_hook(|mut ctx| {
                        ctx.short_circuit("Fechou.");
                        Ok(ctx)
                    }),
                ),
                (
                    HookEvent::AfterMessage,
                    fn_hook(move |ctx| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(ctx)
                    }),
                ),
            ],
        );
        let c = client(provider.clone(), hooks);
        let reply = c.generate(&[], "ok", None).await.unwrap();
        assert_eq!(reply, "Fechou.");
        assert_eq!(provider.calls(), 0);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
        assert!(c.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_hook_rewrite_is_cached() {
        let provider = ScriptedProvider::new(vec![Ok("resposta".to_string())]);
        let hooks = Arc::new(HookEngine::new());
        hooks.register_hooks(
            "upper",
            vec![(
                HookEvent::AfterMessage,
                fn_hook(|mut ctx| {
                    ctx.response = ctx.response.map(|r| r.to_uppercase());
                    Ok(ctx)
                }),
            )],
        );
        let c = client(provider.clone(), hooks);
        assert_eq!(c.generate(&[], "pergunta", None).await.unwrap(), "RESPOSTA");
        assert_eq!(c.generate(&[], "pergunta", None).await.unwrap(), "RESPOSTA");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let provider = ScriptedProvider::new(vec![
            Err(Error::provider(502, "bad gateway")),
            Ok("depois".to_string()),
        ]);
        let c = client(provider.clone(), Arc::new(HookEngine::new()));
        assert_eq!(c.generate(&[], "oi?", None).await.unwrap(), "depois");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_propagates_without_retry() {
        let provider = ScriptedProvider::new(vec![Err(Error::provider(400, "bad request"))]);
        let c = client(provider.clone(), Arc::new(HookEngine::new()));
        let err = c.generate(&[], "oi?", None).await.unwrap_err();
        assert!(matches!(err, Error::Provider { status: 400, .. }));
        assert_eq!(provider.calls(), 1);
        assert!(c.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_windowed() {
        let provider = ScriptedProvider::new(vec![]);
        let c = client(provider.clone(), Arc::new(HookEngine::new()));
        let history = vec![
            Message::user("um"),
            Message::assistant("dois"),
            Message::user("três"),
            Message::assistant("quatro"),
        ];
        c.generate(&history, "cinco", None).await.unwrap();
        let seen = provider.seen.lock().unwrap();
        let contents: Vec<&str> = seen[0].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "três", "quatro", "cinco"]);
    }

    #[test]
    fn test_summary_line_for_older_turns() {
        let history = vec![
            Message::user("quero uma pizza"),
            Message::assistant("qual sabor?"),
            Message::user("margherita"),
        ];
        let mut config = resolved();
        config.history_window = 1;
        let generation = GenerationConfig {
            summarize_history: true,
            summary_chars: 400,
        };
        let messages = build_messages(&config, &history, "e a bebida?", &generation);
        assert_eq!(messages.len(), 4);
        assert!(messages[1].content.starts_with("Resumo de 2 mensagens anteriores"));
        assert!(messages[1].content.contains("user: quero uma pizza"));
        assert_eq!(messages[2].content, "margherita");
        assert_eq!(messages[3], Message::user("e a bebida?"));
    }

    #[test]
    fn test_empty_turns_are_dropped() {
        let history = vec![Message::user(""), Message::assistant("ok")];
        let messages = build_messages(&resolved(), &history, "oi", &GenerationConfig::default());
        assert_eq!(messages.len(), 3);
    }
}
