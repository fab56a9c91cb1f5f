//! Postgres pgmq poll backend.
//!
//! Each job queue is a pgmq queue plus a `<queue>_dlq` companion (pgmq
//! names must be SQL identifiers, so no dot). Workers read batches of up to
//! `prefetch` messages, each hidden for the visibility timeout, and sleep
//! `poll_interval` whenever a read comes back empty.
//!
//! Retries do not use a timer: the failed envelope is re-sent with pgmq's
//! own delivery delay set to the visibility timeout, then the original is
//! deleted.

use super::topology::HandleCache;
use super::{ConsumeOptions, Consumer, Delivery, DeliveryTag, QueueBackend, RetryStrategy};
use crate::db::Db;
use crate::db::pgmq::PgmqMessage;
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct PgmqBackend {
    db: Arc<Db>,
    queues: HandleCache<()>,
}

impl PgmqBackend {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            queues: HandleCache::new(),
        }
    }

    async fn send(&self, queue: &str, envelope: &TaskEnvelope, delay_seconds: i32) -> Result<()> {
        self.ensure(queue).await?;
        let payload = serde_json::to_value(envelope)?;
        let msg_id = self.db.send_to_queue(queue, &payload, delay_seconds).await?;
        debug!(queue, msg_id, envelope_id = %envelope.id, delay_seconds, "sent to pgmq");
        Ok(())
    }
}

/// Whole seconds, rounded up, at least one.
fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueBackend for PgmqBackend {
    fn kind(&self) -> &'static str {
        "pgmq"
    }

    fn dead_letter_name(&self, queue: &str) -> String {
        format!("{queue}_dlq")
    }

    async fn ensure(&self, queue: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        self.queues
            .get_or_establish(
                queue,
                |_| db.is_open(),
                || async {
                    self.db.create_queue(queue).await?;
                    self.db.create_queue(&self.dead_letter_name(queue)).await?;
                    info!(queue, "pgmq queues ready");
                    Ok(())
                },
            )
            .await
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        self.send(queue, envelope, 0).await
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        envelope: &TaskEnvelope,
        delay: Duration,
    ) -> Result<()> {
        self.send(queue, envelope, whole_seconds(delay)).await
    }

    async fn dead_letter(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        self.ensure(queue).await?;
        let payload = serde_json::to_value(envelope)?;
        self.db
            .send_to_queue(&self.dead_letter_name(queue), &payload, 0)
            .await?;
        Ok(())
    }

    async fn consumer(&self, queue: &str, options: ConsumeOptions) -> Result<Box<dyn Consumer>> {
        self.ensure(queue).await?;
        Ok(Box::new(PgmqConsumer {
            db: Arc::clone(&self.db),
            queue: queue.to_string(),
            batch: i32::from(options.prefetch),
            vt_seconds: whole_seconds(options.visibility_timeout),
            poll_interval: options.poll_interval,
            buffer: VecDeque::new(),
        }))
    }

    fn retry_strategy(&self, options: &ConsumeOptions) -> RetryStrategy {
        RetryStrategy::StoreDelay(options.visibility_timeout)
    }

    async fn close(&self) -> Result<()> {
        // The pool belongs to the caller; only forget which queues exist.
        let forgotten = self.queues.drain().await.len();
        debug!(queues = forgotten, "pgmq backend closed");
        Ok(())
    }
}

struct PgmqConsumer {
    db: Arc<Db>,
    queue: String,
    batch: i32,
    vt_seconds: i32,
    poll_interval: Duration,
    buffer: VecDeque<PgmqMessage>,
}

fn msg_id(delivery: &Delivery) -> Result<i64> {
    match delivery.tag {
        DeliveryTag::Pgmq(id) => Ok(id),
        other => Err(Error::Other(format!(
            "delivery tag {other:?} does not belong to pgmq"
        ))),
    }
}

#[async_trait]
impl Consumer for PgmqConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if let Some(msg) = self.buffer.pop_front() {
                return Ok(Some(Delivery {
                    tag: DeliveryTag::Pgmq(msg.msg_id),
                    body: serde_json::to_vec(&msg.message)?,
                    redelivered: msg.read_ct > 1,
                }));
            }

            let batch = self
                .db
                .read_batch(&self.queue, self.vt_seconds, self.batch)
                .await?;
            if batch.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            debug!(queue = %self.queue, count = batch.len(), "read batch");
            self.buffer.extend(batch);
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.db.delete_message(&self.queue, msg_id(delivery)?).await
    }

    async fn discard(&mut self, delivery: &Delivery) -> Result<()> {
        // Archived, not dead-lettered: kept for audit, never redelivered.
        self.db.archive_message(&self.queue, msg_id(delivery)?).await
    }

    async fn requeue(&mut self, delivery: &Delivery) -> Result<()> {
        // The visibility timeout hands it out again.
        debug!(queue = %self.queue, msg_id = msg_id(delivery)?, "left for redelivery");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            debug!(
                queue = %self.queue,
                count = self.buffer.len(),
                "releasing buffered messages to their visibility timeout"
            );
            self.buffer.clear();
        }
        Ok(())
    }
}
