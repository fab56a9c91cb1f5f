//! Handler verdicts.

use serde::{Deserialize, Serialize};

/// What a handler decided about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Done. Acknowledge.
    Success,
    /// Failed. Counts against the retry ceiling.
    Error,
    /// Nothing to do. Acknowledge without penalty.
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A verdict plus an optional human-readable note for the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: TaskStatus,
    pub message: Option<String>,
}

impl TaskResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            message: Some(message.into()),
        }
    }

    /// `Ok` becomes success, `Err` becomes error with the error's text.
    pub fn from_result<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Self {
                status: TaskStatus::Success,
                message: None,
            },
            Err(e) => Self::error(e.to_string()),
        }
    }
}
