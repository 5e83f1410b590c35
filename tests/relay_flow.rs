//! End-to-end flows through the public relay API.

use async_trait::async_trait;
use chat_relay::client::{ModelParams, Provider};
use chat_relay::config::{CacheConfig, DebounceConfig, ProviderConfig, QueueConfig, ReplyConfig, RetryConfig};
use chat_relay::plugins::{BuiltinPlugin, HookEngine, Statistics};
use chat_relay::relay::{ChatTransport, ConversationStore, InMemoryConversationStore};
use chat_relay::{Error, Message, MessageRole, Relay, RelayBuilder, RelayConfig, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, String, Instant)>>,
    broken: AtomicBool,
    /// Text whose next send fails, once.
    drop_once: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.1.clone()).collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(&self, sender_id: &str, text: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let dropped = {
            let mut drop_once = self.drop_once.lock().unwrap();
            if drop_once.as_deref() == Some(text) {
                drop_once.take()
            } else {
                None
            }
        };
        if self.broken.load(Ordering::SeqCst) || dropped.is_some() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session closed",
            )));
        }
        self.sent
            .lock()
            .unwrap()
            .push((sender_id.to_string(), text.to_string(), Instant::now()));
        Ok(())
    }
}

struct FakeProvider {
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
    fail_with: Option<u16>,
}

impl FakeProvider {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            fail_with: None,
        })
    }

    fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            fail_with: Some(status),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, messages: &[Message], _: &ModelParams, _: Duration) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(messages.to_vec());
        if let Some(status) = self.fail_with {
            return Err(Error::provider(status, "upstream said no"));
        }
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("resposta para: {}", last.replace('\n', " / ")))
    }
}

fn config() -> RelayConfig {
    RelayConfig {
        debounce: DebounceConfig::default(),
        queue: QueueConfig::default().with_retry_delay(Duration::from_millis(500)),
        cache: CacheConfig::default(),
        retry: RetryConfig::default().with_base_delay(Duration::from_millis(100)),
        reply: ReplyConfig::default().with_chunking(180, Duration::from_millis(10)),
        ..RelayConfig::default()
    }
}

struct Harness {
    relay: Relay,
    failures: tokio::sync::mpsc::UnboundedReceiver<chat_relay::relay::DispatchFailure>,
    transport: Arc<RecordingTransport>,
    provider: Arc<FakeProvider>,
    store: Arc<InMemoryConversationStore>,
}

fn harness(config: RelayConfig, provider: Arc<FakeProvider>, hooks: Arc<HookEngine>) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let store = Arc::new(InMemoryConversationStore::new());
    let (relay, failures) = RelayBuilder::new()
        .with_config(config)
        .with_provider(provider.clone())
        .with_hooks(hooks)
        .with_store(store.clone())
        .with_transport(transport.clone())
        .build()
        .unwrap();
    Harness {
        relay,
        failures,
        transport,
        provider,
        store,
    }
}

/// Let virtual time run until nothing is buffered, queued or awaiting retry.
async fn settle(relay: &Relay) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if relay.pending_senders() == 0 && relay.queue().is_idle() {
            // one more tick for background persistence
            tokio::time::sleep(Duration::from_millis(50)).await;
            return;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn burst_from_one_sender_becomes_one_reply() {
    let h = harness(config(), FakeProvider::ok(), Arc::new(HookEngine::new()));
    let start = Instant::now();

    h.relay.submit("A", "Oi").unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.relay.submit("A", "tudo bem?").unwrap();
    assert_eq!(h.relay.pending_senders(), 1);

    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert_eq!(h.provider.calls(), 0, "flushed before the window elapsed");

    settle(&h.relay).await;
    assert_eq!(h.provider.calls(), 1);
    let prompt = h.provider.prompts.lock().unwrap()[0].clone();
    assert_eq!(prompt.last().unwrap(), &Message::user("Oi\ntudo bem?"));

    let sent = h.transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "A");
    assert_eq!(sent[0].1, "resposta para: Oi / tudo bem?");
    assert!(sent[0].2 - start >= Duration::from_secs(20));

    let client_id = h.store.get_or_create_client("A").await.unwrap();
    let turns = h.store.turns(&client_id);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, MessageRole::User);
    assert_eq!(turns[1].role, MessageRole::Assistant);
}

#[tokio::test(start_paused = true)]
async fn history_is_sent_on_the_next_message() {
    let h = harness(config(), FakeProvider::ok(), Arc::new(HookEngine::new()));

    h.relay.submit("A", "qual a capital da França?").unwrap();
    settle(&h.relay).await;
    h.relay.submit("A", "e da Itália?").unwrap();
    settle(&h.relay).await;

    let prompts = h.provider.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    let contents: Vec<&str> = prompts[1].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents.len(), 4);
    assert_eq!(contents[1], "qual a capital da França?");
    assert_eq!(contents[3], "e da Itália?");
}

#[tokio::test(start_paused = true)]
async fn fast_auto_reply_skips_the_provider() {
    let hooks = Arc::new(HookEngine::new());
    let stats = Arc::new(Statistics::default());
    hooks.register_plugin(Arc::new(BuiltinPlugin::fast_auto_reply())).unwrap();
    hooks.register_plugin(Arc::new(BuiltinPlugin::statistics(stats.clone()))).unwrap();
    let h = harness(config(), FakeProvider::ok(), hooks);

    h.relay.submit("A", "Oi").unwrap();
    settle(&h.relay).await;

    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.transport.texts(), vec!["Fala! Em que posso te ajudar?"]);
    assert_eq!(h.relay.cache().len(), 0);
    // messageProcessed does not run for short-circuited replies
    assert_eq!(stats.processed(), 0);

    h.relay.hooks().set_enabled("fastAutoReply", false).unwrap();
    h.relay.submit("A", "Oi").unwrap();
    settle(&h.relay).await;
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(stats.processed(), 1);
}

#[tokio::test(start_paused = true)]
async fn identical_questions_hit_the_cache() {
    let h = harness(config(), FakeProvider::ok(), Arc::new(HookEngine::new()));

    h.relay.submit("A", "Qual o horário?").unwrap();
    settle(&h.relay).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.relay.submit("B", "qual o  horário?").unwrap();
    settle(&h.relay).await;

    assert_eq!(h.provider.calls(), 1);
    let texts = h.transport.texts();
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[0], texts[1]);
    assert_eq!(h.relay.stats().cache.hits, 1);

    assert_eq!(h.relay.cache().clear(), 1);
    h.relay.submit("C", "Qual o horário?").unwrap();
    settle(&h.relay).await;
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn provider_failure_sends_the_fallback() {
    let h = harness(config(), FakeProvider::failing(401), Arc::new(HookEngine::new()));
    let mut failures = h.failures;

    h.relay.submit("A", "me ajuda com uma coisa").unwrap();
    settle(&h.relay).await;

    assert_eq!(h.provider.calls(), 1, "auth errors are not retried");
    assert_eq!(
        h.transport.texts(),
        vec!["Estou tendo dificuldades técnicas. Por favor, tente novamente."]
    );
    assert!(failures.try_recv().is_err());

    let client_id = h.store.get_or_create_client("A").await.unwrap();
    let turns = h.store.turns(&client_id);
    assert_eq!(turns.len(), 1, "the fallback is not stored as an assistant turn");
}

#[tokio::test(start_paused = true)]
async fn transient_provider_failure_uses_every_attempt() {
    let h = harness(config(), FakeProvider::failing(503), Arc::new(HookEngine::new()));

    h.relay.submit("A", "me ajuda com uma coisa").unwrap();
    settle(&h.relay).await;

    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.transport.texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn broken_transport_is_retried_then_reported() {
    let h = harness(config(), FakeProvider::ok(), Arc::new(HookEngine::new()));
    let mut failures = h.failures;
    h.transport.broken.store(true, Ordering::SeqCst);

    h.relay.submit("A", "alguém aí?").unwrap();
    settle(&h.relay).await;

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.unit.sender_id, "A");
    assert_eq!(failure.unit.text, "alguém aí?");
    assert_eq!(failure.unit.retry_count, 3);
    assert!(matches!(failure.error, Error::Handler { .. }));
    assert!(failures.try_recv().is_err());
    // first attempt plus three retries, all reusing the one generated reply
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(h.provider.calls(), 1);
    let progress = failure.unit.delivery.unwrap();
    assert_eq!(progress.chunks_sent, 0);
    assert!(progress.reply.starts_with("resposta para:"));
    assert_eq!(h.relay.stats().queue.failed, 1);
    assert!(h.transport.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn long_replies_are_chunked_in_order() {
    struct Verbose;

    #[async_trait]
    impl Provider for Verbose {
        fn name(&self) -> &str {
            "verbose"
        }
        async fn complete(&self, _: &[Message], _: &ModelParams, _: Duration) -> Result<String> {
            Ok("Primeira frase bem curta. Segunda frase também curta. Terceira!".to_string())
        }
    }

    let transport = Arc::new(RecordingTransport::default());
    let config = RelayConfig {
        reply: ReplyConfig::default().with_chunking(30, Duration::from_millis(800)),
        ..config()
    };
    let (relay, _failures) = RelayBuilder::new()
        .with_config(config)
        .with_provider(Arc::new(Verbose))
        .with_transport(transport.clone())
        .build()
        .unwrap();

    relay.submit("A", "conta uma história").unwrap();
    settle(&relay).await;

    let sent = transport.sent.lock().unwrap().clone();
    let texts: Vec<&str> = sent.iter().map(|s| s.1.as_str()).collect();
    assert_eq!(
        texts,
        vec!["Primeira frase bem curta.", "Segunda frase também curta.", "Terceira!"]
    );
    assert!(sent[1].2 - sent[0].2 >= Duration::from_millis(800));
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_is_resent_without_repeating_earlier_ones() {
    struct Verbose;

    #[async_trait]
    impl Provider for Verbose {
        fn name(&self) -> &str {
            "verbose"
        }
        async fn complete(&self, _: &[Message], _: &ModelParams, _: Duration) -> Result<String> {
            Ok("Primeira frase bem curta. Segunda frase também curta. Terceira!".to_string())
        }
    }

    let transport = Arc::new(RecordingTransport::default());
    *transport.drop_once.lock().unwrap() = Some("Segunda frase também curta.".to_string());
    let store = Arc::new(InMemoryConversationStore::new());
    let config = RelayConfig {
        reply: ReplyConfig::default().with_chunking(30, Duration::from_millis(800)),
        ..config()
    };
    let (relay, mut failures) = RelayBuilder::new()
        .with_config(config)
        .with_provider(Arc::new(Verbose))
        .with_store(store.clone())
        .with_transport(transport.clone())
        .build()
        .unwrap();

    relay.submit("A", "conta uma história").unwrap();
    settle(&relay).await;

    assert_eq!(
        transport.texts(),
        vec!["Primeira frase bem curta.", "Segunda frase também curta.", "Terceira!"]
    );
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    assert!(failures.try_recv().is_err());
    assert_eq!(relay.stats().queue.retried, 1);

    let client_id = store.get_or_create_client("A").await.unwrap();
    let turns = store.turns(&client_id);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].role, MessageRole::Assistant);
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_buffered_fragments() {
    let mut h = harness(config(), FakeProvider::ok(), Arc::new(HookEngine::new()));

    h.relay.submit("A", "vou falar depois").unwrap();
    h.relay.shutdown();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.relay.pending_senders(), 0);
    assert_eq!(h.provider.calls(), 0);
    assert!(h.transport.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stats_serialize_for_dashboards() {
    let hooks = Arc::new(HookEngine::new());
    hooks.register_plugin(Arc::new(BuiltinPlugin::sentiment())).unwrap();
    let h = harness(config(), FakeProvider::ok(), hooks);
    h.relay.submit("A", "Oi").unwrap();

    let json = serde_json::to_value(h.relay.stats()).unwrap();
    assert_eq!(json["pending_senders"], 1);
    assert_eq!(json["cache"]["capacity"], 1000);
    assert_eq!(json["plugins"]["total"], 1);
    assert_eq!(json["queue"]["queued"], 0);
}

#[tokio::test]
async fn builder_requires_a_transport() {
    let err = RelayBuilder::new()
        .with_provider(FakeProvider::ok())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[tokio::test]
async fn http_provider_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer test-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Olá do servidor!"}}]}"#)
        .create_async()
        .await;

    let provider_config = ProviderConfig {
        base_url: server.url(),
        ..ProviderConfig::default()
    };
    let provider = chat_relay::client::HttpProvider::new(&provider_config, Some("test-key".to_string())).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let config = RelayConfig {
        debounce: DebounceConfig::default().with_window(Duration::from_millis(20)),
        provider: provider_config,
        ..config()
    };
    let (relay, _failures) = RelayBuilder::new()
        .with_config(config)
        .with_provider(Arc::new(provider))
        .with_transport(transport.clone())
        .build()
        .unwrap();

    relay.submit("A", "bom dia, tudo certo por aí?").unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while transport.texts().is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(transport.texts(), vec!["Olá do servidor!"]);
    mock.assert_async().await;
}
