//! What happens to an inbound message once it has been dequeued.

use super::jobs::ResponseSendingJob;
use crate::error::Result;
use crate::model::message::{BotResponse, IncomingMessage};
use async_trait::async_trait;
use tracing::{debug, info};

/// Boundary to the expense logic. An `Err` counts as a failed delivery
/// and is retried.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &IncomingMessage) -> Result<()>;
}

/// Replies to every non-empty message with a short receipt.
///
/// Stands in for the LLM-backed processor, which lives outside this crate.
pub struct AcknowledgingProcessor {
    responses: ResponseSendingJob,
}

impl AcknowledgingProcessor {
    pub fn new(responses: ResponseSendingJob) -> Self {
        Self { responses }
    }

    fn reply_text(message: &IncomingMessage) -> String {
        format!("Got it: {}", message.message_text.trim())
    }
}

#[async_trait]
impl MessageProcessor for AcknowledgingProcessor {
    async fn process(&self, message: &IncomingMessage) -> Result<()> {
        if message.message_text.trim().is_empty() {
            debug!(chat_id = message.chat_id, "empty message, no reply");
            return Ok(());
        }
        info!(
            telegram_user_id = message.telegram_user_id,
            chat_id = message.chat_id,
            "processing message"
        );
        self.responses
            .schedule_response(&BotResponse {
                chat_id: message.chat_id,
                text: Self::reply_text(message),
                reply_to_message_id: Some(message.message_id),
            })
            .await
    }
}
