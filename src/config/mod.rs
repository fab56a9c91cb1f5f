//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! numeric values are not positive.
//! Connection URLs wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::jobs::backoff::BackoffPolicy;
use crate::model::envelope::DEFAULT_MAX_RETRIES;
use secrecy::SecretString;
use std::time::Duration;

/// Which store carries the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// RabbitMQ, push delivery.
    RabbitMq,
    /// Postgres pgmq, poll delivery.
    Pgmq,
    /// In-process channels. Nothing survives a restart.
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rabbitmq" | "amqp" => Ok(Backend::RabbitMq),
            "pgmq" | "postgres" => Ok(Backend::Pgmq),
            "memory" => Ok(Backend::Memory),
            other => Err(Error::Config(format!("unknown queue backend: {other}"))),
        }
    }
}

/// Knobs shared by every job a factory creates.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Failed deliveries allowed before an envelope is dead-lettered.
    pub max_retries: u32,
    /// Prefetch count (push) or read batch size (poll).
    pub prefetch: u16,
    /// Sleep between empty polls. Poll backends only.
    pub poll_interval: Duration,
    /// How long a read message stays invisible. Poll backends only.
    pub visibility_timeout: Duration,
    /// Timer-driven retry delays. Push backends only.
    pub backoff: BackoffPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            prefetch: 10,
            poll_interval: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueSettings {
    /// Reject zero values. Called by `JobFactory::new`.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be positive".to_string()));
        }
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be positive".to_string()));
        }
        if self.visibility_timeout.as_secs() == 0 {
            return Err(Error::Config(
                "visibility_timeout must be at least one second".to_string(),
            ));
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(Error::Config(
                "backoff base must be positive and not exceed the cap".to_string(),
            ));
        }
        Ok(())
    }
}

/// RabbitMQ topology and connection policy.
#[derive(Debug)]
pub struct AmqpConfig {
    pub url: SecretString,
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub connection_retries: u32,
    pub connection_retry_delay: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub backend: Backend,
    pub amqp: AmqpConfig,
    pub database_url: Option<SecretString>,
    pub queue: QueueSettings,
    pub message_queue: String,
    pub response_queue: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, the container environment provides the vars.
    pub fn from_env() -> Result<Self> {
        let backend: Backend = optional_var("QUEUE_BACKEND")
            .unwrap_or_else(|| "rabbitmq".to_string())
            .parse()?;

        let database_url = optional_var("DATABASE_URL").map(SecretString::from);
        if backend == Backend::Pgmq && database_url.is_none() {
            return Err(Error::Config(
                "required environment variable DATABASE_URL is not set".to_string(),
            ));
        }

        let queue = QueueSettings {
            max_retries: positive_var("QUEUE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            prefetch: positive_var("JOB_BATCH_SIZE", 10)?,
            poll_interval: Duration::from_millis(positive_var("QUEUE_POLL_INTERVAL", 200)?),
            visibility_timeout: Duration::from_secs(positive_var("QUEUE_VISIBILITY_TIMEOUT", 30)?),
            backoff: BackoffPolicy::default(),
        };

        Ok(Self {
            backend,
            amqp: AmqpConfig {
                url: SecretString::from(amqp_url()),
                exchange: var_or("RABBITMQ_EXCHANGE", "telegram_exchange"),
                dead_letter_exchange: var_or("RABBITMQ_DLX_EXCHANGE", "telegram_dlx_exchange"),
                connection_retries: positive_var("RABBITMQ_CONNECTION_RETRIES", 5)?,
                connection_retry_delay: Duration::from_millis(positive_var(
                    "RABBITMQ_CONNECTION_RETRY_DELAY",
                    5000,
                )?),
            },
            database_url,
            queue,
            message_queue: var_or("TELEGRAM_MESSAGE_QUEUE", "telegram_received_messages"),
            response_queue: var_or("BOT_RESPONSE_QUEUE", "telegram_bot_responses"),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }
}

/// `RABBITMQ_URL`, or one assembled from the individual `RABBITMQ_*` parts.
fn amqp_url() -> String {
    if let Some(url) = optional_var("RABBITMQ_URL") {
        return url;
    }
    format!(
        "amqp://{}:{}@{}:{}{}",
        var_or("RABBITMQ_USER", "guest"),
        var_or("RABBITMQ_PASSWORD", "guest"),
        var_or("RABBITMQ_HOST", "localhost"),
        var_or("RABBITMQ_PORT", "5672"),
        var_or("RABBITMQ_VHOST", "/"),
    )
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

/// Parse a numeric var that must be > 0, falling back to `default` when unset.
fn positive_var<T>(name: &str, default: T) -> Result<T>
where
    T: TryFrom<u64>,
{
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw:?}")))?;
    if value <= 0 {
        return Err(Error::Config(format!("{name} must be positive, got {value}")));
    }
    T::try_from(value as u64).map_err(|_| Error::Config(format!("{name} is out of range: {value}")))
}
