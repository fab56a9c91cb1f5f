//! RabbitMQ push backend.
//!
//! Topology per queue: a durable direct exchange routes `queue` to the
//! durable main queue; a second durable direct exchange (the DLX) routes
//! `<queue>.dlq` to the dead-letter queue. The main queue carries no
//! `x-dead-letter-*` arguments: envelopes are moved to the DLQ explicitly
//! once their retry ceiling is hit, and a body rejected with
//! `nack(requeue=false)` is dropped by the broker instead of landing there.
//!
//! Publishing uses one cached, confirm-mode channel per queue. Each worker
//! consumes on its own channel so that closing it on `stop` hands any
//! prefetched, unacked deliveries back to the broker.

use super::topology::HandleCache;
use super::{ConsumeOptions, Consumer, Delivery, DeliveryTag, QueueBackend, RetryStrategy};
use crate::config::AmqpConfig;
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use crate::telemetry::metrics;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer as LapinConsumer,
    ExchangeKind, options::*, types::FieldTable,
};
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PERSISTENT: u8 = 2;

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("backend", "amqp"),
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Owns the broker connection and re-creates it when it drops.
///
/// Connecting is retried `retries` times with a fixed `retry_delay`
/// between attempts; after that the last error goes to the caller.
pub struct AmqpConnector {
    url: SecretString,
    retries: u32,
    retry_delay: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl AmqpConnector {
    pub fn new(url: SecretString, retries: u32, retry_delay: Duration) -> Self {
        Self {
            url,
            retries: retries.max(1),
            retry_delay,
            connection: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AmqpConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.connection_retries,
            config.connection_retry_delay,
        )
    }

    /// The live connection, reconnecting if the previous one is gone.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(Arc::clone(conn));
            }
            warn!("RabbitMQ connection lost, reconnecting");
        }
        let conn = Arc::new(self.connect_with_retry().await?);
        *current = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn connect_with_retry(&self) -> Result<Connection> {
        let mut attempt = 1;
        loop {
            info!(attempt, max = self.retries, "connecting to RabbitMQ");
            match Connection::connect(self.url.expose_secret(), ConnectionProperties::default())
                .await
            {
                Ok(conn) => {
                    info!("connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(e) if attempt < self.retries => {
                    warn!(attempt, max = self.retries, error = %e, "RabbitMQ connect failed, retrying in {:?}", self.retry_delay);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "giving up connecting to RabbitMQ");
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the connection if one is open.
    pub async fn close(&self) -> Result<()> {
        if let Some(conn) = self.connection.lock().await.take() {
            if conn.status().connected() {
                conn.close(200, "Normal shutdown").await?;
                info!("RabbitMQ connection closed");
            }
        }
        Ok(())
    }
}

pub struct AmqpBackend {
    connector: Arc<AmqpConnector>,
    exchange: String,
    dead_letter_exchange: String,
    channels: HandleCache<Channel>,
}

impl AmqpBackend {
    pub fn new(
        connector: Arc<AmqpConnector>,
        exchange: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            exchange: exchange.into(),
            dead_letter_exchange: dead_letter_exchange.into(),
            channels: HandleCache::new(),
        }
    }

    pub fn from_config(connector: Arc<AmqpConnector>, config: &AmqpConfig) -> Self {
        Self::new(
            connector,
            config.exchange.clone(),
            config.dead_letter_exchange.clone(),
        )
    }

    async fn channel(&self, queue: &str) -> Result<Channel> {
        self.channels
            .get_or_establish(
                queue,
                |channel| channel.status().connected(),
                || self.declare(queue),
            )
            .await
    }

    /// Declare both exchanges, both queues and their bindings on a fresh
    /// confirm-mode channel.
    async fn declare(&self, queue: &str) -> Result<Channel> {
        let conn = self.connector.connection().await?;
        let channel = conn.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        for exchange in [&self.exchange, &self.dead_letter_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        let dlq = self.dead_letter_name(queue);
        channel.queue_declare(queue, durable_queue(), FieldTable::default()).await?;
        channel.queue_declare(&dlq, durable_queue(), FieldTable::default()).await?;

        channel
            .queue_bind(
                queue,
                &self.exchange,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &dlq,
                &self.dead_letter_exchange,
                &dlq,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        record(queue, "declare");
        info!(queue, dlq = %dlq, "declared queue topology");
        Ok(channel)
    }

    async fn publish_to(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        envelope: &TaskEnvelope,
    ) -> Result<()> {
        let channel = self.channel(queue).await?;
        let body = envelope.encode()?;
        let props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".to_string().into())
            .with_message_id(envelope.id.clone().into());

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                // The channel may be dead; rebuild it on the next call.
                self.channels.invalidate(queue).await;
                return Err(e.into());
            }
        };

        let confirmation = confirm.await?;
        if confirmation.is_nack() {
            return Err(Error::PublishRejected {
                queue: routing_key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for AmqpBackend {
    fn kind(&self) -> &'static str {
        "amqp"
    }

    fn dead_letter_name(&self, queue: &str) -> String {
        format!("{queue}.dlq")
    }

    async fn ensure(&self, queue: &str) -> Result<()> {
        self.channel(queue).await.map(|_| ())
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        self.publish_to(queue, &self.exchange, queue, envelope).await?;
        record(queue, "publish");
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        let dlq = self.dead_letter_name(queue);
        self.publish_to(queue, &self.dead_letter_exchange, &dlq, envelope).await?;
        record(queue, "dead_letter");
        Ok(())
    }

    async fn consumer(&self, queue: &str, options: ConsumeOptions) -> Result<Box<dyn Consumer>> {
        self.ensure(queue).await?;

        let conn = self.connector.connection().await?;
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("expensio-{queue}-{}", uuid::Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue, consumer_tag = %consumer_tag, prefetch = options.prefetch, "consuming");
        Ok(Box::new(AmqpConsumer {
            queue: queue.to_string(),
            consumer_tag,
            channel,
            consumer,
        }))
    }

    fn retry_strategy(&self, _options: &ConsumeOptions) -> RetryStrategy {
        RetryStrategy::Backoff
    }

    async fn close(&self) -> Result<()> {
        for (queue, channel) in self.channels.drain().await {
            if !channel.status().connected() {
                continue;
            }
            match channel.close(200, "Normal shutdown").await {
                Ok(()) => info!(queue = %queue, "closed channel"),
                Err(e) => warn!(queue = %queue, error = %e, "error closing channel"),
            }
        }
        Ok(())
    }
}

struct AmqpConsumer {
    queue: String,
    consumer_tag: String,
    channel: Channel,
    consumer: LapinConsumer,
}

impl AmqpConsumer {
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                amqp_tag(delivery)?,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

fn amqp_tag(delivery: &Delivery) -> Result<u64> {
    match delivery.tag {
        DeliveryTag::Amqp(tag) => Ok(tag),
        other => Err(Error::Other(format!(
            "delivery tag {other:?} does not belong to RabbitMQ"
        ))),
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: DeliveryTag::Amqp(delivery.delivery_tag),
                body: delivery.data,
                redelivered: delivery.redelivered,
            })),
            Some(Err(e)) => Err(e.into()),
            None => {
                debug!(queue = %self.queue, "consumer stream ended");
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(amqp_tag(delivery)?, BasicAckOptions::default())
            .await?;
        record(&self.queue, "ack");
        Ok(())
    }

    async fn discard(&mut self, delivery: &Delivery) -> Result<()> {
        self.nack(delivery, false).await?;
        record(&self.queue, "discard");
        Ok(())
    }

    async fn requeue(&mut self, delivery: &Delivery) -> Result<()> {
        self.nack(delivery, true).await?;
        record(&self.queue, "requeue");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        self.channel.close(200, "Worker stopped").await?;
        debug!(queue = %self.queue, "consumer channel closed");
        Ok(())
    }
}
