//! The retry-tracked wrapper around a task payload.

use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ceiling assumed for envelopes written without `maxRetries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Wire shape: `{ "id", "data", "attempts", "maxRetries" }`.
///
/// Older producers wrote the identifier as `msgId` and sometimes left out
/// `maxRetries`; both spellings are accepted on decode and a missing ceiling
/// reads as [`DEFAULT_MAX_RETRIES`]. All four keys are always written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Diagnostic identity. Never used for deduplication.
    #[serde(alias = "msgId")]
    pub id: String,

    /// Opaque payload, meaningful only to the handler.
    pub data: serde_json::Value,

    /// Failed deliveries so far.
    #[serde(default)]
    pub attempts: u32,

    /// Retry ceiling fixed when the envelope was scheduled.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl TaskEnvelope {
    /// Wrap a fresh payload: `attempts = 0`, new id.
    pub fn new(data: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: generate_id(),
            data,
            attempts: 0,
            max_retries,
        }
    }

    /// Count one failed delivery and report whether the ceiling is reached.
    pub fn record_failure(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// `<unix millis>-<9 random chars>`.
fn generate_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..9])
}
