//! Per-queue cache of topology handles.
//!
//! Establishing a queue's resources (declares, binds, `pgmq.create`) is a
//! structural operation that must not race with itself. Each queue name gets
//! its own async slot: the first caller establishes while holding the slot,
//! concurrent callers for the same name wait and then reuse the result.
//! Callers for different names never block each other.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type Slot<H> = Arc<Mutex<Option<H>>>;

pub struct HandleCache<H> {
    slots: Mutex<HashMap<String, Slot<H>>>,
}

impl<H> Default for HandleCache<H> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: Clone + Send> HandleCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `queue` if `healthy` accepts it,
    /// otherwise run `establish` and cache its result.
    ///
    /// A failed establishment leaves the slot empty; the error goes to the
    /// caller and the next call tries again.
    pub async fn get_or_establish<F, Fut>(
        &self,
        queue: &str,
        healthy: impl Fn(&H) -> bool,
        establish: F,
    ) -> Result<H>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(queue.to_string()).or_default())
        };

        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            if healthy(handle) {
                return Ok(handle.clone());
            }
            debug!(queue, "cached topology handle is stale, rebuilding");
        }
        *guard = None;

        let handle = establish().await?;
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Forget the handle for `queue`; the next call re-establishes.
    pub async fn invalidate(&self, queue: &str) {
        let slot = self.slots.lock().await.get(queue).cloned();
        if let Some(slot) = slot {
            slot.lock().await.take();
        }
    }

    /// Remove and return every cached handle.
    pub async fn drain(&self) -> Vec<(String, H)> {
        let slots: Vec<(String, Slot<H>)> = self.slots.lock().await.drain().collect();
        let mut handles = Vec::with_capacity(slots.len());
        for (queue, slot) in slots {
            if let Some(handle) = slot.lock().await.take() {
                handles.push((queue, handle));
            }
        }
        handles
    }

    /// Number of queues with a cached handle.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot<H>> = self.slots.lock().await.values().cloned().collect();
        let mut n = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                n += 1;
            }
        }
        n
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
