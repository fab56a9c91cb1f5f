//! Queue backends: the storage-specific half of the job runtime.
//!
//! A backend owns the physical delivery paths (main queue + dead-letter
//! queue) and knows how to publish into them and consume from them. The
//! worker runtime in [`crate::jobs`] only talks to these traits, so the
//! retry state machine is identical across RabbitMQ, pgmq and memory.

pub mod amqp;
pub mod memory;
pub mod pgmq;
pub mod topology;

use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use async_trait::async_trait;
use std::time::Duration;

/// Backend-specific identity of one delivery, used to ack or discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTag {
    /// AMQP channel delivery tag.
    Amqp(u64),
    /// pgmq message id.
    Pgmq(i64),
    /// In-memory sequence number.
    Memory(u64),
}

/// A raw message handed to the worker. The body is not yet decoded.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// True if the store has handed this exact message out before.
    pub redelivered: bool,
}

/// Per-consumer knobs. Push backends ignore the poll fields.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub prefetch: u16,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

/// How a failed-but-retryable envelope gets back onto the main queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// A detached timer task re-publishes after the factory's backoff delay.
    Backoff,
    /// The store itself hides the re-published copy for this long.
    StoreDelay(Duration),
}

/// Topology + producer side of a backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name for logs and metrics ("amqp", "pgmq", "memory").
    fn kind(&self) -> &'static str;

    /// Name of the dead-letter path paired with `queue`.
    fn dead_letter_name(&self, queue: &str) -> String;

    /// Make sure the main and dead-letter paths exist. Idempotent.
    async fn ensure(&self, queue: &str) -> Result<()>;

    /// Durably publish onto the main path.
    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()>;

    /// Durably publish onto the main path, invisible for `delay`.
    async fn publish_delayed(
        &self,
        queue: &str,
        _envelope: &TaskEnvelope,
        _delay: Duration,
    ) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} backend cannot delay publishes to {queue}",
            self.kind()
        )))
    }

    /// Durably publish onto the dead-letter path.
    async fn dead_letter(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()>;

    /// Open a consumer on the main path.
    async fn consumer(&self, queue: &str, options: ConsumeOptions) -> Result<Box<dyn Consumer>>;

    fn retry_strategy(&self, options: &ConsumeOptions) -> RetryStrategy;

    /// Release every cached handle.
    async fn close(&self) -> Result<()>;
}

/// Consumer side of a backend, owned by exactly one worker.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `Ok(None)` means the stream has ended.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Remove the delivery from the main path.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Drop the delivery without requeue and without dead-lettering.
    async fn discard(&mut self, delivery: &Delivery) -> Result<()>;

    /// Hand the delivery back to the store unchanged so it is delivered
    /// again. Stores that redeliver unacked messages on their own may leave
    /// this as a no-op.
    async fn requeue(&mut self, delivery: &Delivery) -> Result<()>;

    /// Stop receiving. Deliveries taken but never acked go back to the
    /// store according to its own rules.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
