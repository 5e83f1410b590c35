//! Context threaded through the hook chain.

use crate::client::ResolvedConfig;
use crate::types::Message;
use serde::Serialize;
use std::collections::HashMap;

/// Coarse polarity assigned by a sentiment hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// State handed from hook to hook for one generation request.
///
/// Each hook receives the context produced by the previous one and returns
/// the context that replaces it. Fields the relay itself reads are typed;
/// anything else a plugin wants to pass along goes in `extras`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineContext {
    pub message: String,
    pub history: Vec<Message>,
    pub config: ResolvedConfig,
    pub user_id: Option<String>,
    /// Set by `beforeMessage` hooks to answer without calling the provider.
    pub auto_response: Option<String>,
    /// Provider output, available to `afterMessage` and `messageProcessed` hooks.
    pub response: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub sentiment_score: i32,
    pub detected_command: Option<String>,
    pub extras: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    pub fn new(message: impl Into<String>, history: Vec<Message>, config: ResolvedConfig) -> Self {
        Self {
            message: message.into(),
            history,
            config,
            user_id: None,
            auto_response: None,
            response: None,
            sentiment: None,
            sentiment_score: 0,
            detected_command: None,
            extras: HashMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Answer with `response` and skip the provider call.
    pub fn short_circuit(&mut self, response: impl Into<String>) {
        self.auto_response = Some(response.into());
    }

    pub fn is_short_circuited(&self) -> bool {
        self.auto_response.is_some()
    }
}
