//! The two queues the bot runs on.

use super::processor::MessageProcessor;
use crate::error::Result;
use crate::jobs::handler::handler_fn;
use crate::jobs::{Job, JobFactory, JobOptions};
use crate::model::TaskResult;
use crate::model::message::{BotResponse, IncomingMessage};
use std::sync::Arc;
use tracing::error;

/// Consumes inbound chat messages and hands them to a [`MessageProcessor`].
#[derive(Clone, Debug)]
pub struct MessageProcessingJob {
    job: Job,
}

impl MessageProcessingJob {
    pub fn new(
        factory: &JobFactory,
        queue: impl Into<String>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let handler = handler_fn(move |payload| {
            let processor = Arc::clone(&processor);
            async move {
                let message: IncomingMessage = match serde_json::from_value(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error = %e, "payload is not an incoming message");
                        return TaskResult::error(format!("invalid message payload: {e}"));
                    }
                };
                match processor.process(&message).await {
                    Ok(()) => TaskResult::success(format!(
                        "message {} processed for chat {}",
                        message.message_id, message.chat_id
                    )),
                    Err(e) => {
                        error!(chat_id = message.chat_id, error = %e, "message processing failed");
                        TaskResult::error(format!("failed to process message: {e}"))
                    }
                }
            }
        });
        Self {
            job: factory.create_job(JobOptions::new(queue).handler(handler)),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn schedule_message(&self, message: &IncomingMessage) -> Result<()> {
        self.job.schedule(message).await
    }
}

/// Producer side of the outbound reply queue. The connector consumes it.
#[derive(Clone, Debug)]
pub struct ResponseSendingJob {
    job: Job,
}

impl ResponseSendingJob {
    pub fn new(factory: &JobFactory, queue: impl Into<String>) -> Self {
        Self {
            job: factory.create_job(JobOptions::new(queue)),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn schedule_response(&self, response: &BotResponse) -> Result<()> {
        self.job.schedule(response).await
    }
}
