//! Jobs: named queues with an optional handler.
//!
//! A [`JobFactory`] owns one backend, the queue settings and the lifecycle
//! registry. Every [`Job`] it creates shares those, so `schedule`, `start`
//! and `stop` behave the same whichever store carries the queue.
//!
//! ```no_run
//! # async fn demo() -> expensio::error::Result<()> {
//! use std::sync::Arc;
//! use expensio::config::QueueSettings;
//! use expensio::jobs::{JobFactory, JobOptions, handler::handler_fn};
//! use expensio::model::TaskResult;
//! use expensio::queue::memory::MemoryBackend;
//!
//! let factory = JobFactory::new(Arc::new(MemoryBackend::new()), QueueSettings::default())?;
//! let job = factory.create_job(
//!     JobOptions::new("emails").handler(handler_fn(|_| async { TaskResult::success("sent") })),
//! );
//! job.start().await?;
//! job.schedule(&serde_json::json!({ "to": "someone" })).await?;
//! factory.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod handler;
pub mod registry;
pub(crate) mod worker;

use crate::config::QueueSettings;
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use crate::queue::{ConsumeOptions, QueueBackend};
use crate::telemetry::metrics;
use handler::SharedHandler;
use opentelemetry::KeyValue;
use registry::{LifecycleRegistry, WorkerHandle};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};
use worker::WorkerRuntime;

/// What a job is bound to. Fixed once the job is created.
#[derive(Clone)]
pub struct JobOptions {
    pub name: String,
    pub handler: Option<SharedHandler>,
    /// Overrides the factory's poll interval for this job.
    pub poll_interval: Option<Duration>,
    /// Overrides the factory's visibility timeout for this job.
    pub visibility_timeout: Option<Duration>,
}

impl JobOptions {
    /// Producer-only options for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            poll_interval: None,
            visibility_timeout: None,
        }
    }

    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("name", &self.name)
            .field("has_handler", &self.handler.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

struct FactoryInner {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    registry: Arc<LifecycleRegistry>,
    closed: AtomicBool,
}

/// Creates jobs over one backend and tears them all down on [`close`](Self::close).
#[derive(Clone)]
pub struct JobFactory {
    inner: Arc<FactoryInner>,
}

impl JobFactory {
    /// Fails with [`Error::Config`] if any setting is zero.
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Result<Self> {
        settings.validate()?;
        info!(
            backend = backend.kind(),
            max_retries = settings.max_retries,
            prefetch = settings.prefetch,
            "job factory ready"
        );
        Ok(Self {
            inner: Arc::new(FactoryInner {
                backend,
                settings,
                registry: Arc::new(LifecycleRegistry::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn create_job(&self, options: JobOptions) -> Job {
        debug!(queue = %options.name, has_handler = options.handler.is_some(), "job created");
        Job {
            factory: self.clone(),
            options,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.inner.backend
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.inner.registry
    }

    /// Queue names with a running worker, sorted.
    pub async fn running_workers(&self) -> Vec<String> {
        self.inner.registry.running().await
    }

    /// Retry timers that have not fired yet.
    pub fn pending_retries(&self) -> usize {
        self.inner.registry.pending_timers()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Stop every worker, cancel every pending retry, release cached handles.
    ///
    /// Idempotent. The connection or pool the backend was built on is left
    /// for its owner to close.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(backend = self.inner.backend.kind(), "closing job factory");
        self.inner.registry.stop_all().await;
        self.inner.registry.cancel_timers().await;
        self.inner.backend.close().await?;
        info!("job factory closed");
        Ok(())
    }
}

/// A named queue plus, optionally, the handler that consumes it.
#[derive(Clone)]
pub struct Job {
    factory: JobFactory,
    options: JobOptions,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("options", &self.options).finish()
    }
}

impl Job {
    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn has_handler(&self) -> bool {
        self.options.handler.is_some()
    }

    /// Publish `payload` as a fresh envelope (`attempts` 0).
    ///
    /// Errors from the backend are returned unchanged; nothing is retried here.
    pub async fn schedule<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        self.factory.check_open()?;
        let queue = self.name();
        let envelope = TaskEnvelope::new(
            serde_json::to_value(payload)?,
            self.factory.settings().max_retries,
        );

        let backend = self.factory.backend();
        let published = match backend.ensure(queue).await {
            Ok(()) => backend.publish(queue, &envelope).await,
            Err(e) => Err(e),
        };

        let result = if published.is_ok() { "ok" } else { "error" };
        metrics::tasks_scheduled().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("result", result),
            ],
        );
        published?;
        info!(queue, id = %envelope.id, "task scheduled");
        Ok(())
    }

    /// Launch the worker for this queue.
    ///
    /// No-op for a producer-only job or when a worker for the name is already
    /// running. Topology or consumer failures are returned and leave nothing
    /// registered.
    pub async fn start(&self) -> Result<()> {
        self.factory.check_open()?;
        let Some(handler) = self.options.handler.clone() else {
            debug!(queue = %self.name(), "producer-only job, nothing to start");
            return Ok(());
        };
        let options = self.consume_options()?;
        let queue = self.name().to_string();
        let backend = Arc::clone(self.factory.backend());
        let registry = Arc::clone(self.factory.registry());
        let backoff = self.factory.settings().backoff;

        let launched = self
            .factory
            .registry()
            .start_with(&queue, || async {
                backend.ensure(&queue).await?;
                let consumer = backend.consumer(&queue, options.clone()).await?;
                let runtime = WorkerRuntime {
                    queue: queue.clone(),
                    backend: Arc::clone(&backend),
                    handler,
                    registry,
                    backoff,
                    options,
                };
                let token = CancellationToken::new();
                let task = tokio::spawn(
                    runtime
                        .run(consumer, token.clone())
                        .instrument(info_span!("worker", queue = %queue)),
                );
                Ok(WorkerHandle { token, task })
            })
            .await?;

        if launched {
            info!(queue = %queue, backend = backend.kind(), "job started");
        }
        Ok(())
    }

    /// Cancel this queue's worker and wait for it to exit.
    ///
    /// A delivery already handed to the handler finishes first. Retry timers
    /// already pending still fire; only [`JobFactory::close`] cancels those.
    pub async fn stop(&self) {
        if self.factory.registry().stop(self.name()).await {
            info!(queue = %self.name(), "job stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.factory.registry().is_running(self.name()).await
    }

    fn consume_options(&self) -> Result<ConsumeOptions> {
        let settings = self.factory.settings();
        let poll_interval = self.options.poll_interval.unwrap_or(settings.poll_interval);
        let visibility_timeout = self
            .options
            .visibility_timeout
            .unwrap_or(settings.visibility_timeout);
        if poll_interval.is_zero() {
            return Err(Error::Config(format!(
                "poll interval for {} must be positive",
                self.name()
            )));
        }
        if visibility_timeout.as_secs() == 0 {
            return Err(Error::Config(format!(
                "visibility timeout for {} must be at least one second",
                self.name()
            )));
        }
        Ok(ConsumeOptions {
            prefetch: settings.prefetch,
            poll_interval,
            visibility_timeout,
        })
    }
}
