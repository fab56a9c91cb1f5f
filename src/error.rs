//! Error types for expensio.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("publish rejected by queue {queue}")]
    PublishRejected { queue: String },

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("queue {0} is not available")]
    QueueUnavailable(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("job factory is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
