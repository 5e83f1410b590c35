//! Per-sender debounce buffer.
//!
//! Fragments from one sender accumulate until the sender has been quiet for
//! the full window. Every new fragment rearms the timer, so the deadline
//! slides. On expiry the fragments are joined with `\n` and handed to the
//! [`DispatchQueue`] as one unit.

use super::queue::{DispatchQueue, DispatchUnit};
use crate::config::{DebounceConfig, OverflowPolicy};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct SenderBuffer {
    fragments: Vec<String>,
    /// Bumped on every rearm; a timer only flushes the buffer it was armed for.
    generation: u64,
    timer: JoinHandle<()>,
    last_update: Instant,
}

struct Inner {
    config: DebounceConfig,
    queue: DispatchQueue,
    buffers: Mutex<HashMap<String, SenderBuffer>>,
}

impl Inner {
    fn buffers(&self) -> MutexGuard<'_, HashMap<String, SenderBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the sender's buffer if it is still the one armed as `generation`,
    /// then enqueue its combined text.
    fn flush(&self, sender_id: &str, generation: Option<u64>) -> bool {
        let buffer = {
            let mut buffers = self.buffers();
            match buffers.get(sender_id) {
                Some(b) if generation.map_or(true, |g| g == b.generation) => {
                    buffers.remove(sender_id)
                }
                _ => None,
            }
        };
        let Some(buffer) = buffer else {
            return false;
        };
        if generation.is_none() {
            buffer.timer.abort();
        }

        let fragments = buffer.fragments.len();
        let text = buffer.fragments.join("\n");
        debug!(
            sender_id,
            fragments,
            idle_ms = buffer.last_update.elapsed().as_millis() as u64,
            "buffer flushed"
        );
        // a rejected unit lands on the queue's failure channel
        if let Err(err) = self.queue.enqueue(DispatchUnit::new(sender_id, text)) {
            warn!(sender_id, error = %err, "flushed buffer not queued");
        }
        true
    }
}

/// Keyed set of sender buffers feeding a [`DispatchQueue`].
pub struct DebounceBuffer {
    inner: Arc<Inner>,
}

impl DebounceBuffer {
    pub fn new(config: DebounceConfig, queue: DispatchQueue) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                buffers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.inner.config
    }

    /// Append `fragment` to the sender's buffer and (re)arm its flush timer.
    ///
    /// Never waits. Must be called from within a Tokio runtime. Fails only
    /// when `max_fragments` is set with [`OverflowPolicy::Reject`] and the
    /// buffer is full.
    pub fn submit(&self, sender_id: &str, fragment: impl Into<String>) -> Result<()> {
        let fragment = fragment.into();
        let mut buffers = self.inner.buffers();

        let (generation, fragments) = match buffers.get_mut(sender_id) {
            Some(buffer) => {
                if let Some(max) = self.inner.config.max_fragments {
                    if buffer.fragments.len() >= max {
                        match self.inner.config.overflow {
                            OverflowPolicy::Reject => {
                                return Err(Error::Capacity(format!(
                                    "buffer for {} is full ({} fragments)",
                                    sender_id, max
                                )));
                            }
                            OverflowPolicy::DropOldest => {
                                buffer.fragments.remove(0);
                            }
                        }
                    }
                }
                buffer.timer.abort();
                buffer.fragments.push(fragment);
                buffer.generation += 1;
                buffer.last_update = Instant::now();
                buffer.timer = self.arm(sender_id, buffer.generation);
                (buffer.generation, buffer.fragments.len())
            }
            None => {
                let timer = self.arm(sender_id, 0);
                buffers.insert(
                    sender_id.to_string(),
                    SenderBuffer {
                        fragments: vec![fragment],
                        generation: 0,
                        timer,
                        last_update: Instant::now(),
                    },
                );
                (0, 1)
            }
        };

        debug!(
            sender_id,
            fragments,
            generation,
            window_ms = self.inner.config.window.as_millis() as u64,
            "fragment buffered"
        );
        Ok(())
    }

    fn arm(&self, sender_id: &str, generation: u64) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let window = self.inner.config.window;
        let sender_id = sender_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush(&sender_id, Some(generation));
            }
        })
    }

    /// Flush the sender's buffer now instead of waiting for the timer.
    pub fn flush_now(&self, sender_id: &str) -> bool {
        self.inner.flush(sender_id, None)
    }

    pub fn pending_senders(&self) -> usize {
        self.inner.buffers().len()
    }

    pub fn pending_fragments(&self, sender_id: &str) -> usize {
        self.inner
            .buffers()
            .get(sender_id)
            .map(|b| b.fragments.len())
            .unwrap_or(0)
    }

    /// Abort every flush timer and discard the buffered fragments.
    /// Returns the number of buffers discarded.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(String, SenderBuffer)> = self.inner.buffers().drain().collect();
        for (_, buffer) in &drained {
            buffer.timer.abort();
        }
        if !drained.is_empty() {
            info!(buffers = drained.len(), "debounce buffers discarded");
        }
        drained.len()
    }
}

impl Drop for DebounceBuffer {
    fn drop(&mut self) {
        for buffer in self.inner.buffers().values() {
            buffer.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::relay::queue::UnitHandler;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        units: Mutex<Vec<(String, String, Instant)>>,
    }

    #[async_trait]
    impl UnitHandler for Collect {
        async fn handle(&self, unit: &mut DispatchUnit) -> Result<()> {
            self.units
                .lock()
                .unwrap()
                .push((unit.sender_id.clone(), unit.text.clone(), Instant::now()));
            Ok(())
        }
    }

    fn buffer(window: Duration) -> (DebounceBuffer, Arc<Collect>) {
        let collect = Arc::new(Collect::default());
        let (queue, _rx) = DispatchQueue::new(QueueConfig::default(), collect.clone());
        (
            DebounceBuffer::new(DebounceConfig::default().with_window(window), queue),
            collect,
        )
    }

    async fn step(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_becomes_one_unit() {
        let (buffer, collect) = buffer(Duration::from_secs(15));
        let start = Instant::now();

        buffer.submit("A", "Oi").unwrap();
        step(5_000).await;
        buffer.submit("A", "tudo bem?").unwrap();
        assert_eq!(buffer.pending_fragments("A"), 2);

        step(14_999).await;
        assert!(collect.units.lock().unwrap().is_empty());
        step(2).await;

        let units = collect.units.lock().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].0, "A");
        assert_eq!(units[0].1, "Oi\ntudo bem?");
        assert!(units[0].2 - start >= Duration::from_secs(20));
        assert_eq!(buffer.pending_senders(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fragment_pushes_deadline() {
        let (buffer, collect) = buffer(Duration::from_millis(1_000));

        buffer.submit("A", "1").unwrap();
        step(999).await;
        buffer.submit("A", "2").unwrap();
        step(999).await;
        assert!(collect.units.lock().unwrap().is_empty());
        step(2).await;
        assert_eq!(collect.units.lock().unwrap()[0].1, "1\n2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_senders_are_independent() {
        let (buffer, collect) = buffer(Duration::from_millis(1_000));

        buffer.submit("A", "a1").unwrap();
        step(500).await;
        buffer.submit("B", "b1").unwrap();
        step(600).await;

        {
            let units = collect.units.lock().unwrap();
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].1, "a1");
        }
        step(500).await;
        assert_eq!(collect.units.lock().unwrap()[1].1, "b1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_after_flush_starts_fresh_buffer() {
        let (buffer, collect) = buffer(Duration::from_millis(1_000));

        buffer.submit("A", "first").unwrap();
        step(1_001).await;
        buffer.submit("A", "second").unwrap();
        assert_eq!(buffer.pending_fragments("A"), 1);
        step(1_001).await;

        let texts: Vec<String> = collect.units.lock().unwrap().iter().map(|u| u.1.clone()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_and_shutdown() {
        let (buffer, collect) = buffer(Duration::from_secs(15));

        buffer.submit("A", "agora").unwrap();
        assert!(buffer.flush_now("A"));
        assert!(!buffer.flush_now("A"));
        step(1).await;
        assert_eq!(collect.units.lock().unwrap().len(), 1);

        buffer.submit("B", "descartado").unwrap();
        assert_eq!(buffer.shutdown(), 1);
        step(20_000).await;
        assert_eq!(collect.units.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_into_full_queue_is_reported() {
        struct Stuck(tokio::sync::Notify);

        #[async_trait]
        impl UnitHandler for Stuck {
            async fn handle(&self, _unit: &mut DispatchUnit) -> Result<()> {
                self.0.notified().await;
                Ok(())
            }
        }

        let config = QueueConfig::default().with_max_len(1, OverflowPolicy::Reject);
        let (queue, mut rx) = DispatchQueue::new(config, Arc::new(Stuck(tokio::sync::Notify::new())));
        let buffer = DebounceBuffer::new(
            DebounceConfig::default().with_window(Duration::from_millis(100)),
            queue.clone(),
        );

        buffer.submit("A", "in flight").unwrap();
        step(101).await;
        buffer.submit("B", "waiting").unwrap();
        step(101).await;
        buffer.submit("C", "no room").unwrap();
        step(101).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(buffer.pending_senders(), 0);
        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.unit.sender_id, "C");
        assert_eq!(failure.unit.text, "no room");
        assert!(matches!(failure.error, Error::Capacity(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_fragments_overflow() {
        let collect = Arc::new(Collect::default());
        let (queue, _rx) = DispatchQueue::new(QueueConfig::default(), collect.clone());
        let config = DebounceConfig::default()
            .with_window(Duration::from_millis(100))
            .with_max_fragments(2, OverflowPolicy::DropOldest);
        let buffer = DebounceBuffer::new(config, queue);

        buffer.submit("A", "1").unwrap();
        buffer.submit("A", "2").unwrap();
        buffer.submit("A", "3").unwrap();
        step(101).await;
        assert_eq!(collect.units.lock().unwrap()[0].1, "2\n3");

        let (queue, _rx) = DispatchQueue::new(QueueConfig::default(), collect.clone());
        let config = DebounceConfig::default().with_max_fragments(1, OverflowPolicy::Reject);
        let buffer = DebounceBuffer::new(config, queue);
        buffer.submit("A", "1").unwrap();
        assert!(matches!(buffer.submit("A", "2"), Err(Error::Capacity(_))));
    }
}
