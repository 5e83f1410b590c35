//! Per-user generation settings.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Everything the generation client needs to know about one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub persona_id: String,
    /// Provider-side model name (e.g. `deepseek/deepseek-chat`).
    pub model: String,
    pub temperature: f32,
    pub token_budget: u32,
    pub system_prompt: String,
    /// Number of most recent turns sent with each request.
    pub history_window: usize,
}

impl ResolvedConfig {
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(Error::configuration_with_context(
                format!("{} is not set", field),
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("config_resolver"),
            ))
        };
        if self.persona_id.trim().is_empty() {
            return missing("persona_id");
        }
        if self.model.trim().is_empty() {
            return missing("model");
        }
        if self.system_prompt.trim().is_empty() {
            return missing("system_prompt");
        }
        Ok(())
    }
}

/// Source of [`ResolvedConfig`] for a user.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve_config(&self, user_id: Option<&str>) -> Result<ResolvedConfig>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    /// Id of the [`ModelProfile`] this persona switches to.
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    /// Name sent to the provider.
    pub name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextType {
    pub id: String,
    pub name: String,
    pub max_history: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreference {
    pub persona: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStats {
    pub personas: usize,
    pub models: usize,
    pub context_types: usize,
    pub current_persona: String,
    pub current_model: String,
    pub current_context: String,
    pub user_preferences: usize,
}

struct State {
    personas: HashMap<String, Persona>,
    models: HashMap<String, ModelProfile>,
    contexts: HashMap<String, ContextType>,
    default_persona: String,
    current_persona: String,
    current_model: String,
    current_context: String,
    preferences: HashMap<String, UserPreference>,
}

/// Resolver backed by in-memory personas, model profiles and context types.
///
/// The active persona, model and context type are global; a user preference
/// overrides persona and model for that user only.
pub struct PersonaResolver {
    state: RwLock<State>,
}

impl PersonaResolver {
    pub fn new(
        personas: Vec<Persona>,
        models: Vec<ModelProfile>,
        contexts: Vec<ContextType>,
        default_persona: &str,
        default_context: &str,
    ) -> Result<Self> {
        let personas: HashMap<_, _> = personas.into_iter().map(|p| (p.id.clone(), p)).collect();
        let models: HashMap<_, _> = models.into_iter().map(|m| (m.id.clone(), m)).collect();
        let contexts: HashMap<_, _> = contexts.into_iter().map(|c| (c.id.clone(), c)).collect();

        let persona = personas
            .get(default_persona)
            .ok_or_else(|| unknown("persona", default_persona))?;
        if !models.contains_key(&persona.model) {
            return Err(unknown("model", &persona.model));
        }
        if !contexts.contains_key(default_context) {
            return Err(unknown("context", default_context));
        }
        let current_model = persona.model.clone();

        Ok(Self {
            state: RwLock::new(State {
                personas,
                models,
                contexts,
                default_persona: default_persona.to_string(),
                current_persona: default_persona.to_string(),
                current_model,
                current_context: default_context.to_string(),
                preferences: HashMap::new(),
            }),
        })
    }

    /// Built-in personas (`default`, `professional`, `coder`, `friendly`),
    /// the DeepSeek model profiles and four context types.
    pub fn with_defaults() -> Self {
        let persona = |id: &str, name: &str, prompt: &str, model: &str| Persona {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            system_prompt: prompt.to_string(),
            model: model.to_string(),
        };
        let model = |id: &str, name: &str, temperature: f32, max_tokens: u32| ModelProfile {
            id: id.to_string(),
            name: name.to_string(),
            temperature,
            max_tokens,
            description: String::new(),
        };
        let context = |id: &str, name: &str, max_history: usize| ContextType {
            id: id.to_string(),
            name: name.to_string(),
            max_history,
        };

        let personas = vec![
            persona("default", "Orbit", "Você é o Orbit, um assistente pessoal direto e informal.", "deepseek-chat"),
            persona("professional", "Orbit - Profissional", "Você é o Orbit, um assistente profissional, claro e objetivo.", "deepseek-chat"),
            persona("coder", "Orbit - Desenvolvedor", "Você é o Orbit, especialista em programação. Dê exemplos práticos.", "deepseek-coder"),
            persona("friendly", "Orbit - Amigável", "Você é o Orbit, um assistente amigável e empático.", "deepseek-chat"),
        ];
        let models = vec![
            model("deepseek-chat", "deepseek/deepseek-chat", 0.7, 800),
            model("deepseek-coder", "deepseek/deepseek-coder", 0.3, 1200),
            model("deepseek-chat-33b", "deepseek/deepseek-chat-33b", 0.8, 1000),
        ];
        let contexts = vec![
            context("conversation", "Conversa Casual", 10),
            context("technical", "Suporte Técnico", 15),
            context("business", "Negócios", 8),
            context("personal", "Pessoal", 5),
        ];

        let state = State {
            personas: personas.into_iter().map(|p| (p.id.clone(), p)).collect(),
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            contexts: contexts.into_iter().map(|c| (c.id.clone(), c)).collect(),
            default_persona: "default".to_string(),
            current_persona: "default".to_string(),
            current_model: "deepseek-chat".to_string(),
            current_context: "conversation".to_string(),
            preferences: HashMap::new(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch the global persona; the model follows the persona's default.
    pub fn set_persona(&self, id: &str) -> Result<()> {
        let mut st = self.write();
        let model = st
            .personas
            .get(id)
            .map(|p| p.model.clone())
            .ok_or_else(|| unknown("persona", id))?;
        info!(from = %st.current_persona, to = id, model = %model, "persona changed");
        st.current_persona = id.to_string();
        st.current_model = model;
        Ok(())
    }

    pub fn set_model(&self, id: &str) -> Result<()> {
        let mut st = self.write();
        if !st.models.contains_key(id) {
            return Err(unknown("model", id));
        }
        st.current_model = id.to_string();
        info!(model = id, "model changed");
        Ok(())
    }

    pub fn set_context(&self, id: &str) -> Result<()> {
        let mut st = self.write();
        if !st.contexts.contains_key(id) {
            return Err(unknown("context", id));
        }
        st.current_context = id.to_string();
        info!(context = id, "context type changed");
        Ok(())
    }

    pub fn set_user_preference(&self, user_id: &str, preference: UserPreference) {
        info!(user_id, persona = ?preference.persona, model = ?preference.model, "user preference set");
        self.write().preferences.insert(user_id.to_string(), preference);
    }

    pub fn user_preference(&self, user_id: &str) -> Option<UserPreference> {
        self.read().preferences.get(user_id).cloned()
    }

    pub fn list_personas(&self) -> Vec<Persona> {
        let mut v: Vec<_> = self.read().personas.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    pub fn list_models(&self) -> Vec<ModelProfile> {
        let mut v: Vec<_> = self.read().models.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    pub fn stats(&self) -> ResolverStats {
        let st = self.read();
        ResolverStats {
            personas: st.personas.len(),
            models: st.models.len(),
            context_types: st.contexts.len(),
            current_persona: st.current_persona.clone(),
            current_model: st.current_model.clone(),
            current_context: st.current_context.clone(),
            user_preferences: st.preferences.len(),
        }
    }

    fn resolve(&self, user_id: Option<&str>) -> Result<ResolvedConfig> {
        let st = self.read();
        let mut persona_id = st.current_persona.as_str();
        let mut model_id = st.current_model.as_str();
        if let Some(pref) = user_id.and_then(|u| st.preferences.get(u)) {
            if let Some(p) = pref.persona.as_deref().filter(|p| st.personas.contains_key(*p)) {
                persona_id = p;
            }
            if let Some(m) = pref.model.as_deref().filter(|m| st.models.contains_key(*m)) {
                model_id = m;
            }
        }

        let persona = st
            .personas
            .get(persona_id)
            .ok_or_else(|| unknown("persona", persona_id))?;
        let model = st
            .models
            .get(model_id)
            .ok_or_else(|| unknown("model", model_id))?;
        let context = st
            .contexts
            .get(&st.current_context)
            .ok_or_else(|| unknown("context", &st.current_context))?;

        let config = ResolvedConfig {
            persona_id: persona.id.clone(),
            model: model.name.clone(),
            temperature: model.temperature,
            token_budget: model.max_tokens,
            system_prompt: persona.system_prompt.clone(),
            history_window: context.max_history,
        };
        config.validate()?;
        Ok(config)
    }
}

#[async_trait]
impl ConfigResolver for PersonaResolver {
    async fn resolve_config(&self, user_id: Option<&str>) -> Result<ResolvedConfig> {
        self.resolve(user_id)
    }
}

/// Resolver that always returns the same settings.
pub struct StaticResolver {
    config: ResolvedConfig,
}

impl StaticResolver {
    pub fn new(config: ResolvedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigResolver for StaticResolver {
    async fn resolve_config(&self, _user_id: Option<&str>) -> Result<ResolvedConfig> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}

fn unknown(kind: &str, id: &str) -> Error {
    Error::configuration_with_context(
        format!("unknown {}: {}", kind, id),
        ErrorContext::new()
            .with_field_path(kind)
            .with_source("persona_resolver"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_resolve() {
        let resolver = PersonaResolver::with_defaults();
        let config = resolver.resolve_config(None).await.unwrap();
        assert_eq!(config.persona_id, "default");
        assert_eq!(config.model, "deepseek/deepseek-chat");
        assert_eq!(config.token_budget, 800);
        assert_eq!(config.history_window, 10);
    }

    #[tokio::test]
    async fn test_persona_switch_moves_model() {
        let resolver = PersonaResolver::with_defaults();
        resolver.set_persona("coder").unwrap();
        let config = resolver.resolve_config(None).await.unwrap();
        assert_eq!(config.persona_id, "coder");
        assert_eq!(config.model, "deepseek/deepseek-coder");
        assert!(resolver.set_persona("pirate").is_err());
    }

    #[tokio::test]
    async fn test_user_preference_overrides_only_that_user() {
        let resolver = PersonaResolver::with_defaults();
        resolver.set_user_preference(
            "5554@c.us",
            UserPreference {
                persona: Some("friendly".to_string()),
                model: Some("deepseek-chat-33b".to_string()),
            },
        );
        let mine = resolver.resolve_config(Some("5554@c.us")).await.unwrap();
        assert_eq!(mine.persona_id, "friendly");
        assert_eq!(mine.model, "deepseek/deepseek-chat-33b");
        let other = resolver.resolve_config(Some("other@c.us")).await.unwrap();
        assert_eq!(other.persona_id, "default");
        assert_eq!(resolver.stats().user_preferences, 1);
    }

    #[tokio::test]
    async fn test_context_sets_history_window() {
        let resolver = PersonaResolver::with_defaults();
        resolver.set_context("personal").unwrap();
        let config = resolver.resolve_config(None).await.unwrap();
        assert_eq!(config.history_window, 5);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let resolver = PersonaResolver::new(
            vec![Persona {
                id: "blank".to_string(),
                name: "Blank".to_string(),
                description: String::new(),
                system_prompt: "  ".to_string(),
                model: "m".to_string(),
            }],
            vec![ModelProfile {
                id: "m".to_string(),
                name: "vendor/m".to_string(),
                temperature: 0.5,
                max_tokens: 100,
                description: String::new(),
            }],
            vec![ContextType {
                id: "c".to_string(),
                name: "C".to_string(),
                max_history: 3,
            }],
            "blank",
            "c",
        )
        .unwrap();
        let err = resolver.resolve_config(None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_retryable());
    }
}
