//! Single-flow dispatch queue.
//!
//! Units are handled strictly one at a time, in FIFO order, across all
//! senders. A failed unit goes back to the tail after a linear backoff
//! (`retry_delay * retry_count`); a unit that fails again after
//! `max_retries` retries is reported on the failure channel and dropped, as
//! is a unit the queue has no room for.

use crate::config::{OverflowPolicy, QueueConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One coalesced message waiting to be handled.
#[derive(Debug, Clone)]
pub struct DispatchUnit {
    pub id: Uuid,
    pub sender_id: String,
    pub text: String,
    /// Retries granted so far.
    pub retry_count: u32,
    pub enqueued_at: Instant,
    /// Set by the handler once a reply exists, so a retry resumes delivery
    /// instead of starting over.
    pub delivery: Option<DeliveryProgress>,
}

/// A reply produced for a unit and how much of it reached the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryProgress {
    pub reply: String,
    /// False when `reply` is the fallback message.
    pub generated: bool,
    pub chunks_sent: usize,
}

impl DispatchUnit {
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            text: text.into(),
            retry_count: 0,
            enqueued_at: Instant::now(),
            delivery: None,
        }
    }
}

/// A unit the queue gave up on, with the error that ended it.
#[derive(Debug)]
pub struct DispatchFailure {
    pub unit: DispatchUnit,
    pub error: Error,
}

/// Handles one unit. Changes made to the unit survive into its retries.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn handle(&self, unit: &mut DispatchUnit) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub draining: bool,
    pub pending_retries: usize,
    pub handled: u64,
    pub retried: u64,
    pub failed: u64,
}

#[derive(Default)]
struct State {
    units: VecDeque<DispatchUnit>,
    draining: bool,
    pending_retries: usize,
}

struct Inner {
    config: QueueConfig,
    handler: Arc<dyn UnitHandler>,
    state: Mutex<State>,
    failures: mpsc::UnboundedSender<DispatchFailure>,
    handled: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

impl DispatchQueue {
    /// Create a queue and the receiving end of its failure channel.
    ///
    /// Dropping the receiver is allowed; failures are still logged.
    pub fn new(
        config: QueueConfig,
        handler: Arc<dyn UnitHandler>,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(State::default()),
                failures: tx,
                handled: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        };
        (queue, rx)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `unit` and start the drain task if it is not running.
    ///
    /// Must be called from within a Tokio runtime. Fails only when a
    /// `max_len` is configured with [`OverflowPolicy::Reject`] and the queue
    /// is full; the rejected unit is also reported on the failure channel.
    pub fn enqueue(&self, unit: DispatchUnit) -> Result<()> {
        let (start, dropped) = {
            let mut st = self.state();
            let mut dropped = None;
            if let Some(max) = self.inner.config.max_len {
                if st.units.len() >= max {
                    match self.inner.config.overflow {
                        OverflowPolicy::Reject => {
                            drop(st);
                            self.report(unit, queue_full(max));
                            return Err(queue_full(max));
                        }
                        OverflowPolicy::DropOldest => dropped = st.units.pop_front(),
                    }
                }
            }
            debug!(unit_id = %unit.id, sender_id = %unit.sender_id, retry_count = unit.retry_count, "unit enqueued");
            st.units.push_back(unit);
            let start = !st.draining;
            st.draining = true;
            (start, dropped)
        };

        if let Some(unit) = dropped {
            self.report(unit, Error::Capacity("dropped to make room in the dispatch queue".to_string()));
        }
        if start {
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }
        Ok(())
    }

    async fn drain(self) {
        debug!("drain started");
        loop {
            let mut unit = {
                let mut st = self.state();
                match st.units.pop_front() {
                    Some(unit) => unit,
                    None => {
                        st.draining = false;
                        break;
                    }
                }
            };

            let result = AssertUnwindSafe(self.inner.handler.handle(&mut unit))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::handler("unit handler panicked")));
            match result {
                Ok(()) => {
                    self.inner.handled.fetch_add(1, Ordering::Relaxed);
                    debug!(unit_id = %unit.id, sender_id = %unit.sender_id, "unit handled");
                }
                Err(err) => self.on_failure(unit, err),
            }
        }
        debug!("drain finished");
    }

    fn on_failure(&self, mut unit: DispatchUnit, err: Error) {
        if unit.retry_count >= self.inner.config.max_retries {
            self.report(unit, err);
            return;
        }
        unit.retry_count += 1;

        let delay = self.inner.config.retry_delay.saturating_mul(unit.retry_count);
        warn!(
            unit_id = %unit.id,
            sender_id = %unit.sender_id,
            retry_count = unit.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "unit failed, scheduling retry"
        );
        self.inner.retried.fetch_add(1, Ordering::Relaxed);
        self.state().pending_retries += 1;

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // a full queue reports the unit itself
            let _ = queue.enqueue(unit);
            queue.state().pending_retries -= 1;
        });
    }

    fn report(&self, unit: DispatchUnit, err: Error) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            unit_id = %unit.id,
            sender_id = %unit.sender_id,
            retry_count = unit.retry_count,
            error = %err,
            "unit dropped"
        );
        let _ = self.inner.failures.send(DispatchFailure { unit, error: err });
    }

    /// Units waiting to be handled, not counting the one in flight.
    pub fn len(&self) -> usize {
        self.state().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.state().draining
    }

    /// True when nothing is queued, in flight, or waiting to be retried.
    pub fn is_idle(&self) -> bool {
        let st = self.state();
        st.units.is_empty() && !st.draining && st.pending_retries == 0
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.state();
        QueueStats {
            queued: st.units.len(),
            draining: st.draining,
            pending_retries: st.pending_retries,
            handled: self.inner.handled.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

fn queue_full(max: usize) -> Error {
    Error::Capacity(format!("dispatch queue is full ({} units)", max))
}
