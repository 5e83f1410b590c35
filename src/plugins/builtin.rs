//! Built-in plugins.
//!
//! None of these are registered by default; pass them to
//! [`HookEngine::register_plugin`](super::HookEngine::register_plugin).

use super::context::{PipelineContext, Sentiment};
use super::engine::Plugin;
use super::hooks::{Hook, HookEvent};
use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

static EMOJI_ONLY: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[\p{Emoji}\p{Emoji_Presentation}\p{Emoji_Modifier}\p{Emoji_Component}\p{Extended_Pictographic}\s]+$").ok()
});

/// Annotates the context with a word-count sentiment.
pub struct SentimentAnalysis {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl Default for SentimentAnalysis {
    fn default() -> Self {
        Self::new(
            &["bom", "ótimo", "excelente", "legal", "gosto", "adoro", "feliz"],
            &["ruim", "péssimo", "horrível", "odeio", "triste", "chato", "problema"],
        )
    }
}

impl SentimentAnalysis {
    pub fn new(positive: &[&str], negative: &[&str]) -> Self {
        Self {
            positive: positive.iter().map(|w| w.to_lowercase()).collect(),
            negative: negative.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    /// Returns the polarity and `positive - negative` hit count.
    pub fn score(&self, text: &str) -> (Sentiment, i32) {
        let text = text.to_lowercase();
        let hits = |words: &[String]| words.iter().filter(|w| text.contains(w.as_str())).count() as i32;
        let score = hits(&self.positive) - hits(&self.negative);
        let sentiment = match score {
            s if s > 0 => Sentiment::Positive,
            s if s < 0 => Sentiment::Negative,
            _ => Sentiment::Neutral,
        };
        (sentiment, score)
    }
}

#[async_trait]
impl Hook for SentimentAnalysis {
    async fn call(&self, mut ctx: PipelineContext) -> Result<PipelineContext> {
        let (sentiment, score) = self.score(&ctx.message);
        ctx.sentiment = Some(sentiment);
        ctx.sentiment_score = score;
        Ok(ctx)
    }
}

/// Maps trigger words to command names (`ajuda` → `help`, ...).
pub struct CommandDetector {
    commands: Vec<(String, String)>,
}

impl Default for CommandDetector {
    fn default() -> Self {
        Self::new(&[
            ("ajuda", "help"),
            ("status", "status"),
            ("info", "info"),
            ("limpar", "clear"),
            ("config", "config"),
        ])
    }
}

impl CommandDetector {
    /// Triggers are matched as substrings, first match wins.
    pub fn new(commands: &[(&str, &str)]) -> Self {
        Self {
            commands: commands
                .iter()
                .map(|(t, c)| (t.to_lowercase(), c.to_string()))
                .collect(),
        }
    }

    pub fn detect(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.commands
            .iter()
            .find(|(trigger, _)| text.contains(trigger.as_str()))
            .map(|(_, command)| command.as_str())
    }
}

#[async_trait]
impl Hook for CommandDetector {
    async fn call(&self, mut ctx: PipelineContext) -> Result<PipelineContext> {
        if let Some(command) = self.detect(&ctx.message) {
            ctx.detected_command = Some(command.to_string());
        }
        Ok(ctx)
    }
}

/// Answers trivial messages without calling the provider.
#[derive(Debug, Clone, Default)]
pub struct FastAutoReply;

const GREETINGS: &[&str] = &["oi", "olá", "ola", "bom dia", "boa tarde", "boa noite", "e aí", "eaí"];
const CONFIRMS: &[&str] = &["ok", "blz", "beleza", "valeu", "vlw", "tá", "ta", "tmj"];

impl FastAutoReply {
    /// The canned reply for `text`, if it is trivial enough to get one.
    pub fn quick_reply(text: &str) -> Option<&'static str> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        let greeting = GREETINGS
            .iter()
            .any(|g| text == *g || text.starts_with(&format!("{} ", g)));
        if greeting {
            return Some("Fala! Em que posso te ajudar?");
        }
        if CONFIRMS.contains(&text.as_str()) {
            return Some("Fechou.");
        }
        if text == "?" || text == "??" {
            return Some("Manda a dúvida.");
        }
        let emoji_only = EMOJI_ONLY
            .as_ref()
            .map(|re| re.is_match(&text))
            .unwrap_or(false);
        if emoji_only {
            return Some("👀");
        }
        if text.chars().count() <= 3 {
            return Some("Diga.");
        }
        None
    }
}

#[async_trait]
impl Hook for FastAutoReply {
    async fn call(&self, mut ctx: PipelineContext) -> Result<PipelineContext> {
        if let Some(reply) = Self::quick_reply(&ctx.message) {
            ctx.short_circuit(reply);
        }
        Ok(ctx)
    }
}

/// Counts processed messages and logs one event per message.
#[derive(Debug, Default)]
pub struct Statistics {
    processed: AtomicU64,
}

impl Statistics {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Hook for Statistics {
    async fn call(&self, ctx: PipelineContext) -> Result<PipelineContext> {
        let total = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            user_id = ?ctx.user_id,
            message_len = ctx.message.chars().count(),
            response_len = ctx.response.as_deref().map(|r| r.chars().count()).unwrap_or(0),
            total,
            "message processed"
        );
        Ok(ctx)
    }
}

/// Wraps a single hook as a named [`Plugin`].
pub struct BuiltinPlugin {
    name: &'static str,
    description: &'static str,
    event: HookEvent,
    hook: Arc<dyn Hook>,
}

impl BuiltinPlugin {
    pub fn sentiment() -> Self {
        Self {
            name: "sentimentAnalysis",
            description: "Analisa o sentimento das mensagens",
            event: HookEvent::BeforeMessage,
            hook: Arc::new(SentimentAnalysis::default()),
        }
    }

    pub fn command_detector() -> Self {
        Self {
            name: "commandDetector",
            description: "Detecta comandos especiais nas mensagens",
            event: HookEvent::BeforeMessage,
            hook: Arc::new(CommandDetector::default()),
        }
    }

    pub fn fast_auto_reply() -> Self {
        Self {
            name: "fastAutoReply",
            description: "Responde mensagens simples sem acionar o provedor",
            event: HookEvent::BeforeMessage,
            hook: Arc::new(FastAutoReply),
        }
    }

    /// The statistics plugin, sharing `stats` so the caller can read the counter.
    pub fn statistics(stats: Arc<Statistics>) -> Self {
        Self {
            name: "statistics",
            description: "Coleta estatísticas de uso",
            event: HookEvent::MessageProcessed,
            hook: stats,
        }
    }
}

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        self.description
    }

    fn hooks(&self) -> Vec<(HookEvent, Arc<dyn Hook>)> {
        vec![(self.event.clone(), self.hook.clone())]
    }
}
