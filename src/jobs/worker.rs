//! The consume loop and the retry/backoff/dead-letter state machine.
//!
//! Per delivery: decode → handler → verdict.
//!
//! - success, cancelled: ack.
//! - error: `attempts += 1`. At the ceiling the envelope goes to the
//!   dead-letter path and the original is acked. Below it the updated
//!   envelope is handed back to the main queue (timer re-publish or
//!   store-side delay, per backend) and only then is the original acked.
//! - body is not an envelope at all: discard, no counters touched.
//! - the dead-letter or delayed publish itself fails: the original goes
//!   back to the store unchanged, to be handled again once it returns.
//!
//! Nothing a single delivery does can end the loop.

use super::backoff::BackoffPolicy;
use super::handler::SharedHandler;
use super::registry::LifecycleRegistry;
use crate::model::{TaskEnvelope, TaskResult, TaskStatus};
use crate::queue::{ConsumeOptions, Consumer, Delivery, QueueBackend, RetryStrategy};
use crate::telemetry::job::{record_envelope, record_outcome, record_verdict, start_delivery_span};
use crate::telemetry::metrics;
use futures_util::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Pause after a failed receive or a lost consumer before trying again.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause before handing back a delivery whose dead-letter or delayed
/// publish failed, so an outage does not turn into a hot redelivery loop.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct WorkerRuntime {
    pub queue: String,
    pub backend: Arc<dyn QueueBackend>,
    pub handler: SharedHandler,
    pub registry: Arc<LifecycleRegistry>,
    pub backoff: BackoffPolicy,
    pub options: ConsumeOptions,
}

impl WorkerRuntime {
    /// Consume until `token` is cancelled.
    ///
    /// Cancellation is only observed between deliveries: a delivery already
    /// handed to the handler runs to completion and is acked or retried
    /// before the loop exits.
    pub async fn run(self, mut consumer: Box<dyn Consumer>, token: CancellationToken) {
        let strategy = self.backend.retry_strategy(&self.options);
        info!(queue = %self.queue, backend = self.backend.kind(), ?strategy, "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = consumer.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.process(consumer.as_mut(), delivery, strategy).await;
                }
                Ok(None) => {
                    warn!(queue = %self.queue, "delivery stream ended, reopening consumer");
                    match self.reopen(&token).await {
                        Some(fresh) => consumer = fresh,
                        None => break,
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "receive failed");
                    if !pause(&token, RECEIVE_RETRY_DELAY).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = consumer.close().await {
            warn!(queue = %self.queue, error = %e, "error closing consumer");
        }
        info!(queue = %self.queue, "worker stopped");
    }

    /// Keep trying to open a new consumer. `None` if cancelled first.
    async fn reopen(&self, token: &CancellationToken) -> Option<Box<dyn Consumer>> {
        loop {
            if !pause(token, RECEIVE_RETRY_DELAY).await {
                return None;
            }
            match self.backend.consumer(&self.queue, self.options.clone()).await {
                Ok(consumer) => return Some(consumer),
                Err(e) => warn!(queue = %self.queue, error = %e, "cannot reopen consumer"),
            }
        }
    }

    async fn process(
        &self,
        consumer: &mut dyn Consumer,
        delivery: Delivery,
        strategy: RetryStrategy,
    ) {
        let span = start_delivery_span(&self.queue);
        self.process_in_span(consumer, delivery, strategy, span.clone())
            .instrument(span)
            .await
    }

    async fn process_in_span(
        &self,
        consumer: &mut dyn Consumer,
        delivery: Delivery,
        strategy: RetryStrategy,
        span: Span,
    ) {
        let envelope = match TaskEnvelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, redelivered = delivery.redelivered, "discarding malformed delivery");
                metrics::discarded().add(1, &[KeyValue::new("queue", self.queue.clone())]);
                record_outcome(&span, "discarded");
                if let Err(e) = consumer.discard(&delivery).await {
                    error!(error = %e, "failed to discard malformed delivery");
                }
                return;
            }
        };
        record_envelope(&span, &envelope.id, envelope.attempts);
        debug!(id = %envelope.id, attempts = envelope.attempts, "processing");

        let result = self.invoke(&envelope).await;
        record_verdict(&span, &result.status.to_string());
        metrics::deliveries().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("verdict", result.status.to_string()),
            ],
        );

        match result.status {
            TaskStatus::Success => {
                info!(id = %envelope.id, note = result.message.as_deref().unwrap_or(""), "job completed");
                ack(consumer, &delivery, &span, "acked").await;
            }
            TaskStatus::Cancelled => {
                info!(id = %envelope.id, note = result.message.as_deref().unwrap_or(""), "job cancelled");
                ack(consumer, &delivery, &span, "acked").await;
            }
            TaskStatus::Error => {
                warn!(id = %envelope.id, note = result.message.as_deref().unwrap_or(""), "job failed");
                self.fail(consumer, &delivery, envelope, strategy, &span).await;
            }
        }
    }

    /// Call the handler; a panic counts as an error verdict.
    async fn invoke(&self, envelope: &TaskEnvelope) -> TaskResult {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(envelope.data.clone()))
            .catch_unwind()
            .await;
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("queue", self.queue.clone())],
        );
        outcome.unwrap_or_else(|panic| {
            TaskResult::error(format!("handler panicked: {}", panic_message(panic.as_ref())))
        })
    }

    async fn fail(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        mut envelope: TaskEnvelope,
        strategy: RetryStrategy,
        span: &Span,
    ) {
        let exhausted = envelope.record_failure();
        record_envelope(span, &envelope.id, envelope.attempts);

        if exhausted {
            match self.backend.dead_letter(&self.queue, &envelope).await {
                Ok(()) => {
                    warn!(
                        id = %envelope.id,
                        attempts = envelope.attempts,
                        dlq = %self.backend.dead_letter_name(&self.queue),
                        "moved to dead-letter queue"
                    );
                    metrics::dead_lettered().add(1, &[KeyValue::new("queue", self.queue.clone())]);
                    ack(consumer, delivery, span, "dead_lettered").await;
                }
                Err(e) => {
                    error!(id = %envelope.id, error = %e, "dead-letter publish failed, requeueing delivery");
                    record_outcome(span, "dead_letter_failed");
                    requeue(consumer, delivery).await;
                }
            }
            return;
        }

        match strategy {
            RetryStrategy::Backoff => {
                let delay = self.backoff.delay_for(envelope.attempts);
                info!(
                    id = %envelope.id,
                    attempt = envelope.attempts,
                    max = envelope.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                let backend = Arc::clone(&self.backend);
                let queue = self.queue.clone();
                self.registry.spawn_timer(delay, async move {
                    if let Err(e) = backend.publish(&queue, &envelope).await {
                        error!(queue = %queue, id = %envelope.id, error = %e, "retry publish failed");
                    }
                });
                metrics::retries().add(
                    1,
                    &[
                        KeyValue::new("queue", self.queue.clone()),
                        KeyValue::new("strategy", "backoff"),
                    ],
                );
                ack(consumer, delivery, span, "retry").await;
            }
            RetryStrategy::StoreDelay(delay) => {
                match self.backend.publish_delayed(&self.queue, &envelope, delay).await {
                    Ok(()) => {
                        info!(
                            id = %envelope.id,
                            attempt = envelope.attempts,
                            max = envelope.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "retry re-queued with store delay"
                        );
                        metrics::retries().add(
                            1,
                            &[
                                KeyValue::new("queue", self.queue.clone()),
                                KeyValue::new("strategy", "store_delay"),
                            ],
                        );
                        ack(consumer, delivery, span, "retry").await;
                    }
                    Err(e) => {
                        error!(id = %envelope.id, error = %e, "retry publish failed, requeueing delivery");
                        record_outcome(span, "retry_failed");
                        requeue(consumer, delivery).await;
                    }
                }
            }
        }
    }
}

async fn ack(consumer: &mut dyn Consumer, delivery: &Delivery, span: &Span, outcome: &str) {
    match consumer.ack(delivery).await {
        Ok(()) => record_outcome(span, outcome),
        Err(e) => {
            error!(error = %e, "ack failed");
            record_outcome(span, "ack_failed");
        }
    }
}

/// Give an unfinished delivery back to the store after [`REQUEUE_DELAY`].
/// The stored body still carries the pre-failure `attempts`, so the next
/// delivery re-runs the handler and re-checks the ceiling.
async fn requeue(consumer: &mut dyn Consumer, delivery: &Delivery) {
    tokio::time::sleep(REQUEUE_DELAY).await;
    if let Err(e) = consumer.requeue(delivery).await {
        error!(error = %e, "requeue failed");
    }
}

/// Sleep for `delay`. False if `token` was cancelled first.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
