//! Generation provider: one stateless chat-completion call per request.

use crate::config::ProviderConfig;
use crate::types::Message;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

/// Sampling parameters sent with each call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Send the ordered message list and return the assistant's text.
    async fn complete(
        &self,
        messages: &[Message],
        params: &ModelParams,
        timeout: Duration,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints (OpenRouter by default).
pub struct HttpProvider {
    client: reqwest::Client,
    provider_id: String,
    endpoint: String,
    api_key: Option<String>,
    referer: Option<String>,
    title: Option<String>,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Result<Self> {
        let base = url::Url::parse(&config.base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid provider base URL: {}", e),
                ErrorContext::new()
                    .with_field_path("provider.base_url")
                    .with_source("http_provider"),
            )
        })?;
        let endpoint = format!("{}/chat/completions", base.as_str().trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        Ok(Self {
            client,
            provider_id: config.provider_id.clone(),
            endpoint,
            api_key,
            referer: config.referer.clone(),
            title: config.title.clone(),
        })
    }

    /// Build a provider whose API key comes from the OS keyring or the environment.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let key = Self::resolve_api_key(&config.provider_id);
        Self::new(config, key)
    }

    fn resolve_api_key(provider_id: &str) -> Option<String> {
        // 1. Keyring
        if let Ok(entry) = Entry::new("chat-relay", provider_id) {
            if let Ok(key) = entry.get_password() {
                return Some(key);
            }
        }

        // 2. Environment variable (PROVIDER_API_KEY)
        let env_var = format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"));
        env::var(env_var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &ModelParams,
        timeout: Duration,
    ) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            Error::configuration_with_context(
                "provider API key is missing",
                ErrorContext::new().with_source("http_provider"),
            )
        })?;

        let body = CompletionRequest {
            model: &params.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };
        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&body);
        if let Some(ref referer) = self.referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(ref title) = self.title {
            request = request.header("X-Title", title);
        }

        debug!(
            model = %params.model,
            messages = messages.len(),
            timeout_ms = timeout.as_millis() as u64,
            "sending completion request"
        );
        let start = std::time::Instant::now();
        let resp = request.send().await.map_err(|e| map_send_error(e, timeout))?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            info!(
                http_status = status,
                model = %params.model,
                duration_ms = start.elapsed().as_millis() as u64,
                "completion request failed"
            );
            return Err(Error::provider(status, body));
        }

        let parsed: CompletionResponse = resp.json().await.map_err(|e| {
            if e.is_decode() {
                Error::Provider {
                    status: 502,
                    message: format!("malformed completion body: {}", e),
                    retryable: true,
                }
            } else {
                map_send_error(e, timeout)
            }
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty());

        match content {
            Some(text) => {
                info!(
                    http_status = status,
                    model = %params.model,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "completion received"
                );
                Ok(text)
            }
            // An empty or malformed body from a 2xx is an upstream glitch, worth another attempt.
            None => Err(Error::Provider {
                status: 502,
                message: "provider returned no completion content".to_string(),
                retryable: true,
            }),
        }
    }
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            after_ms: timeout.as_millis() as u64,
        }
    } else {
        Error::Transport(e)
    }
}
