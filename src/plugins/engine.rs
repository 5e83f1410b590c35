//! Hook and middleware registry.

use super::context::PipelineContext;
use super::hooks::{Hook, HookEvent, HookSlot};
use super::middleware::{run_from, Middleware, MiddlewareSlot, Terminal};
use crate::types::InboundMessage;
use crate::{Error, ErrorContext, Result};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A bundle of hooks and optional middleware registered under one owner name.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;
    fn hooks(&self) -> Vec<(HookEvent, Arc<dyn Hook>)>;
    fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub enabled: bool,
    pub registered_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub hooks: usize,
    pub middleware: usize,
}

#[derive(Default)]
struct Registry {
    owners: HashMap<String, PluginInfo>,
    /// Registration order per owner, for stable listing.
    order: Vec<String>,
    hooks: HashMap<HookEvent, Vec<HookSlot>>,
    middleware: Vec<MiddlewareSlot>,
}

impl Registry {
    fn ensure_owner(&mut self, owner: &str) {
        if !self.owners.contains_key(owner) {
            self.owners.insert(owner.to_string(), info_for(owner, "", ""));
            self.order.push(owner.to_string());
        }
    }

    fn is_enabled(&self, owner: &str) -> bool {
        self.owners.get(owner).map(|o| o.enabled).unwrap_or(false)
    }
}

fn info_for(name: &str, version: &str, description: &str) -> PluginInfo {
    let registered_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    PluginInfo {
        name: name.to_string(),
        version: version.to_string(),
        description: description.to_string(),
        enabled: true,
        registered_at_ms,
    }
}

/// Registry of hook handlers and middleware, grouped by owner.
///
/// Handlers for one event run in registration order. Disabling an owner
/// skips its handlers without removing them.
#[derive(Default)]
pub struct HookEngine {
    inner: RwLock<Registry>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append handlers under `owner`, creating the owner (enabled) if needed.
    pub fn register_hooks<I>(&self, owner: &str, hooks: I)
    where
        I: IntoIterator<Item = (HookEvent, Arc<dyn Hook>)>,
    {
        let mut reg = self.write();
        reg.ensure_owner(owner);
        for (event, hook) in hooks {
            debug!(owner, event = %event, "hook registered");
            reg.hooks.entry(event).or_default().push(HookSlot {
                owner: owner.to_string(),
                hook,
            });
        }
    }

    pub fn register_middleware(&self, owner: &str, middleware: Arc<dyn Middleware>) {
        let mut reg = self.write();
        reg.ensure_owner(owner);
        reg.middleware.push(MiddlewareSlot {
            owner: owner.to_string(),
            middleware,
        });
    }

    /// Register a plugin's hooks and middleware under its name.
    ///
    /// Fails if name, version or description is empty, or if the name is taken.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        for (field, value) in [
            ("name", plugin.name()),
            ("version", plugin.version()),
            ("description", plugin.description()),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_with_context(
                    format!("plugin {} is required", field),
                    ErrorContext::new()
                        .with_field_path(format!("plugin.{}", field))
                        .with_source("hook_engine"),
                ));
            }
        }

        let name = plugin.name().to_string();
        {
            let mut reg = self.write();
            if reg.owners.contains_key(&name) {
                return Err(Error::validation_with_context(
                    format!("plugin '{}' is already registered", name),
                    ErrorContext::new().with_source("hook_engine"),
                ));
            }
            reg.owners.insert(
                name.clone(),
                info_for(&name, plugin.version(), plugin.description()),
            );
            reg.order.push(name.clone());
        }

        self.register_hooks(&name, plugin.hooks());
        if let Some(mw) = plugin.middleware() {
            self.register_middleware(&name, mw);
        }
        info!(plugin = %name, version = plugin.version(), "plugin registered");
        Ok(())
    }

    /// Remove an owner and everything it registered.
    pub fn unregister(&self, owner: &str) -> bool {
        let mut reg = self.write();
        if reg.owners.remove(owner).is_none() {
            return false;
        }
        reg.order.retain(|o| o != owner);
        for slots in reg.hooks.values_mut() {
            slots.retain(|s| s.owner != owner);
        }
        reg.middleware.retain(|m| m.owner != owner);
        info!(plugin = owner, "plugin removed");
        true
    }

    pub fn set_enabled(&self, owner: &str, enabled: bool) -> Result<()> {
        let mut reg = self.write();
        let info = reg
            .owners
            .get_mut(owner)
            .ok_or_else(|| Error::PluginNotFound(owner.to_string()))?;
        info.enabled = enabled;
        info!(plugin = owner, enabled, "plugin status changed");
        Ok(())
    }

    pub fn is_enabled(&self, owner: &str) -> bool {
        self.read().is_enabled(owner)
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        let reg = self.read();
        reg.order
            .iter()
            .filter_map(|name| reg.owners.get(name).cloned())
            .collect()
    }

    pub fn stats(&self) -> PluginStats {
        let reg = self.read();
        let total = reg.owners.len();
        let enabled = reg.owners.values().filter(|o| o.enabled).count();
        PluginStats {
            total,
            enabled,
            disabled: total - enabled,
            hooks: reg.hooks.values().map(Vec::len).sum(),
            middleware: reg.middleware.len(),
        }
    }

    /// Run every enabled handler for `event`, in registration order.
    ///
    /// A handler that fails or panics is logged and skipped; the chain
    /// continues with the last context that came out of a successful handler.
    pub async fn run_hooks(&self, event: &HookEvent, ctx: PipelineContext) -> PipelineContext {
        let slots: Vec<HookSlot> = {
            let reg = self.read();
            reg.hooks
                .get(event)
                .map(|v| {
                    v.iter()
                        .filter(|s| reg.is_enabled(&s.owner))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut current = ctx;
        for slot in slots {
            let outcome = AssertUnwindSafe(slot.hook.call(current.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(next)) => {
                    debug!(event = %event, owner = %slot.owner, "hook executed");
                    current = next;
                }
                Ok(Err(err)) => {
                    warn!(event = %event, owner = %slot.owner, error = %err, "hook failed, skipping");
                }
                Err(_) => {
                    warn!(event = %event, owner = %slot.owner, "hook panicked, skipping");
                }
            }
        }
        current
    }

    /// Run the enabled middleware chain around `terminal`.
    pub async fn run_middleware(&self, input: InboundMessage, terminal: &Terminal) -> Result<String> {
        let chain: Vec<MiddlewareSlot> = {
            let reg = self.read();
            reg.middleware
                .iter()
                .filter(|m| reg.is_enabled(&m.owner))
                .cloned()
                .collect()
        };
        run_from(&chain, 0, terminal, input).await
    }
}
