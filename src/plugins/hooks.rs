//! Hook system.

use super::context::PipelineContext;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Named interception points of the generation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Before cache lookup and provider call. May short-circuit.
    BeforeMessage,
    /// After a provider response, before it is cached. May rewrite `response`.
    AfterMessage,
    /// After the final response is cached. Observers only.
    MessageProcessed,
    /// Extension point owned by an embedding application.
    Custom(String),
}

impl HookEvent {
    pub fn name(&self) -> &str {
        match self {
            HookEvent::BeforeMessage => "beforeMessage",
            HookEvent::AfterMessage => "afterMessage",
            HookEvent::MessageProcessed => "messageProcessed",
            HookEvent::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A handler for one [`HookEvent`]. Returns the context that replaces its input.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: PipelineContext) -> Result<PipelineContext>;
}

/// Adapter turning a synchronous closure into a [`Hook`].
pub struct FnHook<F> {
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(PipelineContext) -> Result<PipelineContext> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(PipelineContext) -> Result<PipelineContext> + Send + Sync,
{
    async fn call(&self, ctx: PipelineContext) -> Result<PipelineContext> {
        (self.func)(ctx)
    }
}

/// Shorthand for `Arc::new(FnHook::new(func))`.
pub fn fn_hook<F>(func: F) -> Arc<dyn Hook>
where
    F: Fn(PipelineContext) -> Result<PipelineContext> + Send + Sync + 'static,
{
    Arc::new(FnHook::new(func))
}

#[derive(Clone)]
pub(crate) struct HookSlot {
    pub owner: String,
    pub hook: Arc<dyn Hook>,
}
