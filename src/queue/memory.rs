//! In-process push backend.
//!
//! Each queue is an unbounded tokio channel of raw bodies. Every publish,
//! ack, discard, requeue and dead letter is also written to a per-queue
//! journal so tests (and local dev runs) can observe exactly what the worker
//! did. Receive faults and stream ends can be injected on demand. Nothing
//! survives a restart.

use super::topology::HandleCache;
use super::{ConsumeOptions, Consumer, Delivery, DeliveryTag, QueueBackend, RetryStrategy};
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// What travels through a queue's channel.
enum Item {
    Body {
        seq: u64,
        bytes: Vec<u8>,
        redelivered: bool,
    },
    /// Make the consumer's next receive fail.
    ReceiveFault,
    /// End the consumer's delivery stream.
    EndOfStream,
}

/// What happened on one queue.
#[derive(Debug, Clone, Default)]
pub struct QueueJournal {
    /// Envelopes published onto the main path, retries included.
    pub published: Vec<TaskEnvelope>,
    /// Delivery sequence numbers acknowledged.
    pub acked: Vec<u64>,
    /// Delivery sequence numbers discarded as malformed.
    pub discarded: Vec<u64>,
    /// Delivery sequence numbers handed back for redelivery.
    pub requeued: Vec<u64>,
    /// Envelopes moved to the dead-letter path.
    pub dead_letters: Vec<TaskEnvelope>,
}

#[derive(Clone)]
struct MemoryQueue {
    tx: mpsc::UnboundedSender<Item>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Item>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    // Queues outlive `close` of their cached handle so a reopened backend
    // still sees undelivered bodies.
    queues: Mutex<HashMap<String, MemoryQueue>>,
    handles: HandleCache<MemoryQueue>,
    journals: Arc<Mutex<HashMap<String, QueueJournal>>>,
    seq: Arc<AtomicU64>,
    reject_publishes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail, as a broker outage would.
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Push raw bytes onto the main path, bypassing envelope encoding.
    pub async fn publish_raw(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.send(
            queue,
            Item::Body {
                seq,
                bytes: body,
                redelivered: false,
            },
        )
        .await
    }

    /// Fail the next receive on `queue`, as a dropped broker link would.
    /// Bodies already queued behind it are delivered afterwards.
    pub async fn fail_next_receive(&self, queue: &str) -> Result<()> {
        self.send(queue, Item::ReceiveFault).await
    }

    /// End the current consumer's delivery stream on `queue`, as a broker
    /// cancelling the consumer would.
    pub async fn end_stream(&self, queue: &str) -> Result<()> {
        self.send(queue, Item::EndOfStream).await
    }

    async fn send(&self, queue: &str, item: Item) -> Result<()> {
        let handle = self.handle(queue).await?;
        handle
            .tx
            .send(item)
            .map_err(|_| Error::QueueUnavailable(queue.to_string()))
    }

    /// Snapshot of the journal for `queue`.
    pub async fn journal(&self, queue: &str) -> QueueJournal {
        self.journals
            .lock()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    async fn handle(&self, queue: &str) -> Result<MemoryQueue> {
        self.handles
            .get_or_establish(
                queue,
                |q| !q.tx.is_closed(),
                || async {
                    let mut queues = self.queues.lock().await;
                    let q = queues.entry(queue.to_string()).or_insert_with(MemoryQueue::new);
                    debug!(queue, "memory queue ready");
                    Ok(q.clone())
                },
            )
            .await
    }

    async fn journal_mut<F: FnOnce(&mut QueueJournal)>(&self, queue: &str, f: F) {
        let mut journals = self.journals.lock().await;
        f(journals.entry(queue.to_string()).or_default());
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn dead_letter_name(&self, queue: &str) -> String {
        format!("{queue}.dlq")
    }

    async fn ensure(&self, queue: &str) -> Result<()> {
        self.handle(queue).await.map(|_| ())
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(Error::PublishRejected {
                queue: queue.to_string(),
            });
        }
        self.publish_raw(queue, envelope.encode()?).await?;
        let envelope = envelope.clone();
        self.journal_mut(queue, |j| j.published.push(envelope)).await;
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(Error::PublishRejected {
                queue: self.dead_letter_name(queue),
            });
        }
        let envelope = envelope.clone();
        self.journal_mut(queue, |j| j.dead_letters.push(envelope)).await;
        Ok(())
    }

    async fn consumer(&self, queue: &str, _options: ConsumeOptions) -> Result<Box<dyn Consumer>> {
        let handle = self.handle(queue).await?;
        Ok(Box::new(MemoryConsumer {
            queue: queue.to_string(),
            tx: handle.tx,
            rx: handle.rx,
            seq: Arc::clone(&self.seq),
            journals: Arc::clone(&self.journals),
        }))
    }

    fn retry_strategy(&self, _options: &ConsumeOptions) -> RetryStrategy {
        RetryStrategy::Backoff
    }

    async fn close(&self) -> Result<()> {
        let dropped = self.handles.drain().await.len();
        debug!(queues = dropped, "memory backend closed");
        Ok(())
    }
}

struct MemoryConsumer {
    queue: String,
    tx: mpsc::UnboundedSender<Item>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Item>>>,
    seq: Arc<AtomicU64>,
    journals: Arc<Mutex<HashMap<String, QueueJournal>>>,
}

impl MemoryConsumer {
    fn delivery_seq(delivery: &Delivery) -> u64 {
        match delivery.tag {
            DeliveryTag::Memory(seq) => seq,
            _ => u64::MAX,
        }
    }

    async fn journal(&self, f: impl FnOnce(&mut QueueJournal)) {
        let mut journals = self.journals.lock().await;
        f(journals.entry(self.queue.clone()).or_default());
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Item::Body {
                seq,
                bytes,
                redelivered,
            }) => Ok(Some(Delivery {
                tag: DeliveryTag::Memory(seq),
                body: bytes,
                redelivered,
            })),
            Some(Item::ReceiveFault) => Err(Error::QueueUnavailable(self.queue.clone())),
            Some(Item::EndOfStream) | None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let seq = Self::delivery_seq(delivery);
        self.journal(|j| j.acked.push(seq)).await;
        Ok(())
    }

    async fn discard(&mut self, delivery: &Delivery) -> Result<()> {
        let seq = Self::delivery_seq(delivery);
        self.journal(|j| j.discarded.push(seq)).await;
        Ok(())
    }

    async fn requeue(&mut self, delivery: &Delivery) -> Result<()> {
        let seq = Self::delivery_seq(delivery);
        let item = Item::Body {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            bytes: delivery.body.clone(),
            redelivered: true,
        };
        self.tx
            .send(item)
            .map_err(|_| Error::QueueUnavailable(self.queue.clone()))?;
        self.journal(|j| j.requeued.push(seq)).await;
        Ok(())
    }
}
