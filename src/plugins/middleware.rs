//! Middleware system.
//!
//! Middleware wraps the terminal operation onion-style: each layer gets the
//! inbound message and a [`Next`] handle, and decides whether to continue,
//! answer on its own, or do work around the rest of the chain.

use crate::types::InboundMessage;
use crate::{Error, Result};
use async_recursion::async_recursion;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// The operation at the center of the chain.
pub type Terminal = dyn Fn(InboundMessage) -> BoxFuture<'static, Result<String>> + Send + Sync;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, input: InboundMessage, next: Next<'_>) -> Result<String>;
}

#[derive(Clone)]
pub(crate) struct MiddlewareSlot {
    pub owner: String,
    pub middleware: Arc<dyn Middleware>,
}

enum Downstream {
    NotCalled,
    Succeeded(String),
    Failed,
}

/// Continuation handed to a middleware. Consumed on use, so the rest of the
/// chain runs at most once per layer.
pub struct Next<'a> {
    chain: &'a [MiddlewareSlot],
    index: usize,
    terminal: &'a Terminal,
    outcome: &'a Mutex<Downstream>,
}

impl<'a> Next<'a> {
    pub async fn run(self, input: InboundMessage) -> Result<String> {
        let result = run_from(self.chain, self.index, self.terminal, input).await;
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *outcome = match &result {
            Ok(text) => Downstream::Succeeded(text.clone()),
            Err(_) => Downstream::Failed,
        };
        result
    }
}

/// Run the chain starting at `index`.
///
/// A layer that fails or panics on its own is logged and skipped: if it
/// never called `next`, the chain continues with the following layer; if the
/// rest of the chain had already answered, that answer is kept. Errors coming
/// from further down the chain propagate unchanged, and a panicking terminal
/// surfaces as [`Error::Handler`].
#[async_recursion]
pub(crate) async fn run_from(
    chain: &[MiddlewareSlot],
    index: usize,
    terminal: &Terminal,
    input: InboundMessage,
) -> Result<String> {
    let Some(slot) = chain.get(index) else {
        return AssertUnwindSafe(terminal(input))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::handler("terminal operation panicked")));
    };

    let outcome = Mutex::new(Downstream::NotCalled);
    let next = Next {
        chain,
        index: index + 1,
        terminal,
        outcome: &outcome,
    };
    let result = AssertUnwindSafe(slot.middleware.process(input.clone(), next))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(plugin_error(slot.owner.clone(), "middleware panicked")));
    let err = match result {
        Ok(text) => return Ok(text),
        Err(err) => err,
    };

    let downstream = std::mem::replace(
        &mut *outcome.lock().unwrap_or_else(PoisonError::into_inner),
        Downstream::NotCalled,
    );
    match downstream {
        Downstream::Failed => Err(err),
        Downstream::Succeeded(text) => {
            warn!(owner = %slot.owner, error = %err, "middleware failed after next(), keeping downstream reply");
            Ok(text)
        }
        Downstream::NotCalled => {
            warn!(owner = %slot.owner, error = %err, "middleware failed, skipping");
            run_from(chain, index + 1, terminal, input).await
        }
    }
}

/// Build an [`Error::Plugin`] for middleware and hook implementations.
pub fn plugin_error(owner: impl Into<String>, message: impl Into<String>) -> Error {
    Error::Plugin {
        owner: owner.into(),
        message: message.into(),
    }
}
