//! Per-unit conversation pipeline.

use super::ports::{ChatTransport, ConversationStore};
use super::queue::{DeliveryProgress, DispatchUnit, UnitHandler};
use crate::client::GenerationClient;
use crate::config::ReplyConfig;
use crate::plugins::HookEngine;
use crate::types::{InboundMessage, MessageRole};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{error, info, warn};

static SENTENCE_BREAK: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[.!?]\s+").ok());

/// Handles one dispatch unit: load history, generate through the middleware
/// chain, deliver the reply in chunks, persist both turns in the background.
///
/// A generation failure is answered with the fallback message and counts as
/// handled. Store and transport failures are returned, so the queue retries
/// the unit. Once a reply exists it is kept on the unit, and a retry sends
/// only the chunks that did not get through.
pub struct MessageHandler {
    client: Arc<GenerationClient>,
    hooks: Arc<HookEngine>,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    reply: ReplyConfig,
}

impl MessageHandler {
    pub fn new(
        client: Arc<GenerationClient>,
        hooks: Arc<HookEngine>,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        reply: ReplyConfig,
    ) -> Self {
        Self {
            client,
            hooks,
            store,
            transport,
            reply,
        }
    }

    /// `None` when generation failed or produced nothing to send.
    async fn generate(&self, unit: &DispatchUnit, client_id: &str) -> Result<Option<String>> {
        let history = self
            .store
            .recent_turns(client_id, self.reply.history_limit)
            .await?;

        let client = self.client.clone();
        let history = Arc::new(history);
        let terminal = move |input: InboundMessage| {
            let client = client.clone();
            let history = history.clone();
            async move {
                client
                    .generate(&history, &input.text, Some(&input.sender_id))
                    .await
            }
            .boxed()
        };

        let input = InboundMessage::new(unit.sender_id.clone(), unit.text.clone());
        Ok(match self.hooks.run_middleware(input, &terminal).await {
            Ok(reply) if !reply.trim().is_empty() => Some(reply),
            Ok(_) => {
                warn!(sender_id = %unit.sender_id, unit_id = %unit.id, "empty reply, sending fallback");
                None
            }
            Err(err) => {
                error!(
                    sender_id = %unit.sender_id,
                    unit_id = %unit.id,
                    error = %err,
                    "generation failed, sending fallback"
                );
                None
            }
        })
    }

    fn persist(&self, client_id: String, user_text: String, reply: Option<String>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append_turn(&client_id, MessageRole::User, &user_text).await {
                warn!(client_id = %client_id, error = %err, "failed to persist user turn");
            }
            if let Some(reply) = reply {
                if let Err(err) = store
                    .append_turn(&client_id, MessageRole::Assistant, &reply)
                    .await
                {
                    warn!(client_id = %client_id, error = %err, "failed to persist assistant turn");
                }
            }
        });
    }

    /// Send the chunks not yet delivered, advancing `progress` after each one.
    async fn deliver(&self, sender_id: &str, progress: &mut DeliveryProgress) -> Result<()> {
        let chunks = split_reply(&progress.reply, self.reply.chunk_chars);
        let first = progress.chunks_sent;
        for (i, chunk) in chunks.iter().enumerate().skip(first) {
            if i > first && !self.reply.chunk_delay.is_zero() {
                tokio::time::sleep(self.reply.chunk_delay).await;
            }
            self.transport.send_text(sender_id, chunk).await.map_err(|e| {
                Error::handler_with_context(
                    format!("delivery failed: {}", e),
                    ErrorContext::new()
                        .with_details(format!("chunk {} of {}", i + 1, chunks.len()))
                        .with_source("message_handler"),
                )
            })?;
            progress.chunks_sent = i + 1;
        }
        Ok(())
    }
}

#[async_trait]
impl UnitHandler for MessageHandler {
    async fn handle(&self, unit: &mut DispatchUnit) -> Result<()> {
        let client_id = self.store.get_or_create_client(&unit.sender_id).await?;
        let progress = match unit.delivery.take() {
            Some(progress) => {
                info!(
                    sender_id = %unit.sender_id,
                    unit_id = %unit.id,
                    chunks_sent = progress.chunks_sent,
                    "resuming delivery"
                );
                progress
            }
            None => {
                let generated = self.generate(unit, &client_id).await?;
                DeliveryProgress {
                    generated: generated.is_some(),
                    reply: generated.unwrap_or_else(|| self.reply.fallback_message.clone()),
                    chunks_sent: 0,
                }
            }
        };

        let progress = unit.delivery.insert(progress);
        self.deliver(&unit.sender_id, progress).await?;
        info!(
            sender_id = %unit.sender_id,
            unit_id = %unit.id,
            reply_len = progress.reply.chars().count(),
            "reply delivered"
        );
        let reply = progress.generated.then(|| progress.reply.clone());
        self.persist(client_id, unit.text.clone(), reply);
        Ok(())
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Sentences (ending in `.`, `!` or `?` followed by whitespace) are packed
/// greedily; a sentence longer than `max_chars` is split at whitespace, and a
/// single word longer than that is split hard.
pub fn split_reply(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences(text) {
        let joined = if current.is_empty() {
            sentence.chars().count()
        } else {
            current.chars().count() + 1 + sentence.chars().count()
        };
        if joined <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if sentence.chars().count() > max_chars {
            chunks.extend(split_long(sentence, max_chars));
        } else {
            current.push_str(sentence);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn sentences(text: &str) -> Vec<&str> {
    let Some(re) = SENTENCE_BREAK.as_ref() else {
        return vec![text];
    };
    let mut out = Vec::new();
    let mut last = 0;
    for m in re.find_iter(text) {
        // punctuation is ASCII, so the sentence ends one byte past the match start
        let end = m.start() + 1;
        let sentence = text[last..end].trim();
        if !sentence.is_empty() {
            out.push(sentence);
        }
        last = m.end();
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn split_long(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                parts.push(piece.iter().collect());
            }
            continue;
        }
        let needed = if current.is_empty() { word_len } else { current_len + 1 + word_len };
        if needed > max_chars {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
