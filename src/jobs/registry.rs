//! Running workers and pending retry timers.
//!
//! At most one worker per queue name. Each name has its own async slot;
//! `start_with` holds it while launching and `stop` holds it until the old
//! worker has exited, so a `stop` racing a `start` can never leave two
//! workers consuming the same queue. Different names never wait on each
//! other.
//!
//! Retry timers are tracked separately from workers: stopping a worker
//! leaves its pending retries alone, only [`LifecycleRegistry::cancel_timers`]
//! (called by `JobFactory::close`) cancels them.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

/// A launched worker: how to ask it to stop, and how to wait for it.
pub struct WorkerHandle {
    pub token: CancellationToken,
    pub task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Cancel and wait for the task to exit.
    async fn shutdown(self, queue: &str) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(queue, error = %e, "worker task ended abnormally");
        }
    }

    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

type Slot = Arc<Mutex<Option<WorkerHandle>>>;

pub struct LifecycleRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    timers: TaskTracker,
    timers_cancelled: CancellationToken,
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timers: TaskTracker::new(),
            timers_cancelled: CancellationToken::new(),
        }
    }

    async fn slot(&self, queue: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(queue.to_string()).or_default())
    }

    async fn all_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(queue, slot)| (queue.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Run `launch` and register its worker, unless one is already
    /// registered for `queue`. Returns whether a worker was launched.
    ///
    /// The queue's slot stays locked while `launch` runs, so concurrent
    /// starts for the same name cannot both launch, and a start cannot slip
    /// in while a `stop` is still waiting for the old worker. A `launch`
    /// error registers nothing and is returned as-is.
    pub async fn start_with<F, Fut>(&self, queue: &str, launch: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WorkerHandle>>,
    {
        let slot = self.slot(queue).await;
        let mut current = slot.lock().await;
        if let Some(existing) = current.take() {
            if existing.is_live() {
                debug!(queue, "worker already running");
                *current = Some(existing);
                return Ok(false);
            }
            // The previous worker exited on its own; reap it.
            existing.shutdown(queue).await;
        }
        *current = Some(launch().await?);
        Ok(true)
    }

    /// Cancel and await the worker for `queue`, then unregister it.
    /// Returns false if none was registered.
    pub async fn stop(&self, queue: &str) -> bool {
        let slot = self.slot(queue).await;
        let mut current = slot.lock().await;
        match current.take() {
            Some(handle) => {
                handle.shutdown(queue).await;
                true
            }
            None => false,
        }
    }

    /// Stop every registered worker.
    pub async fn stop_all(&self) {
        for (queue, slot) in self.all_slots().await {
            let mut current = slot.lock().await;
            if let Some(handle) = current.take() {
                handle.shutdown(&queue).await;
                info!(queue = %queue, "worker stopped");
            }
        }
    }

    pub async fn is_running(&self, queue: &str) -> bool {
        let slot = self.slots.lock().await.get(queue).cloned();
        match slot {
            Some(slot) => slot.lock().await.as_ref().is_some_and(WorkerHandle::is_live),
            None => false,
        }
    }

    /// Queue names with a registered worker, sorted.
    pub async fn running(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (queue, slot) in self.all_slots().await {
            if slot.lock().await.is_some() {
                names.push(queue);
            }
        }
        names.sort();
        names
    }

    /// Run `task` after `delay` on a detached, tracked task.
    ///
    /// The task is dropped unrun if [`cancel_timers`](Self::cancel_timers)
    /// is called first.
    pub fn spawn_timer<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = self.timers_cancelled.clone();
        self.timers.spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => debug!("retry timer cancelled"),
                    _ = tokio::time::sleep(delay) => task.await,
                }
            }
            .in_current_span(),
        );
    }

    /// Timers spawned and not yet finished.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every pending timer and wait until all have exited.
    pub async fn cancel_timers(&self) {
        let pending = self.timers.len();
        self.timers_cancelled.cancel();
        self.timers.close();
        self.timers.wait().await;
        if pending > 0 {
            info!(pending, "cancelled pending retry timers");
        }
    }
}
