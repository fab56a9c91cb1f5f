//! The bot's message and response jobs over the in-memory backend.

mod common;

use async_trait::async_trait;
use common::{fast_settings, wait_for_journal};
use expensio::app::{
    AcknowledgingProcessor, MessageProcessingJob, MessageProcessor, ResponseSendingJob,
    WorkerProcessor,
};
use expensio::error::{Error, Result};
use expensio::jobs::JobFactory;
use expensio::model::message::{BotResponse, IncomingMessage};
use expensio::queue::memory::MemoryBackend;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const MESSAGES: &str = "telegram_received_messages";
const RESPONSES: &str = "telegram_bot_responses";

fn message(text: &str) -> IncomingMessage {
    IncomingMessage {
        telegram_user_id: 1001,
        chat_id: 55,
        message_text: text.to_string(),
        timestamp: "2025-08-22T10:00:00Z".to_string(),
        message_id: 7,
    }
}

struct FailingProcessor {
    calls: AtomicU32,
}

#[async_trait]
impl MessageProcessor for FailingProcessor {
    async fn process(&self, _message: &IncomingMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Other("expense parser unavailable".to_string()))
    }
}

#[tokio::test]
async fn incoming_message_produces_a_reply() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let responses = ResponseSendingJob::new(&factory, RESPONSES);
    let processor = Arc::new(AcknowledgingProcessor::new(responses.clone()));
    let messages = MessageProcessingJob::new(&factory, MESSAGES, processor);

    let workers = WorkerProcessor::new(vec![messages.job().clone(), responses.job().clone()]);
    workers.start_workers().await.unwrap();
    assert!(messages.job().is_running().await);
    // The response job is producer-only here.
    assert!(!responses.job().is_running().await);

    messages.schedule_message(&message("lunch 12")).await.unwrap();

    let replies = wait_for_journal(&backend, RESPONSES, |j| j.published.len() == 1).await;
    let reply: BotResponse = serde_json::from_value(replies.published[0].data.clone()).unwrap();
    assert_eq!(
        reply,
        BotResponse {
            chat_id: 55,
            text: "Got it: lunch 12".to_string(),
            reply_to_message_id: Some(7),
        }
    );
    wait_for_journal(&backend, MESSAGES, |j| j.acked.len() == 1).await;

    workers.stop_workers().await;
    assert!(!messages.job().is_running().await);
    factory.close().await.unwrap();
}

#[tokio::test]
async fn blank_message_is_acked_without_reply() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let responses = ResponseSendingJob::new(&factory, RESPONSES);
    let messages = MessageProcessingJob::new(
        &factory,
        MESSAGES,
        Arc::new(AcknowledgingProcessor::new(responses)),
    );

    messages.job().start().await.unwrap();
    messages.schedule_message(&message("   ")).await.unwrap();

    wait_for_journal(&backend, MESSAGES, |j| j.acked.len() == 1).await;
    assert!(backend.journal(RESPONSES).await.published.is_empty());
    factory.close().await.unwrap();
}

#[tokio::test]
async fn payload_that_is_not_a_message_is_retried_then_dead_lettered() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(2)).unwrap();
    let responses = ResponseSendingJob::new(&factory, RESPONSES);
    let messages = MessageProcessingJob::new(
        &factory,
        MESSAGES,
        Arc::new(AcknowledgingProcessor::new(responses)),
    );

    messages.job().start().await.unwrap();
    // A valid envelope whose payload lacks every message field.
    messages.job().schedule(&json!({"chatId": "nope"})).await.unwrap();

    let journal = wait_for_journal(&backend, MESSAGES, |j| j.dead_letters.len() == 1).await;
    assert_eq!(journal.dead_letters[0].attempts, 2);
    assert!(journal.discarded.is_empty());
    assert!(backend.journal(RESPONSES).await.published.is_empty());
    factory.close().await.unwrap();
}

#[tokio::test]
async fn processor_errors_drive_retries() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let processor = Arc::new(FailingProcessor {
        calls: AtomicU32::new(0),
    });
    let messages = MessageProcessingJob::new(&factory, MESSAGES, processor.clone());

    messages.job().start().await.unwrap();
    messages.schedule_message(&message("taxi 20")).await.unwrap();

    let journal = wait_for_journal(&backend, MESSAGES, |j| j.dead_letters.len() == 1).await;
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    let dead: IncomingMessage =
        serde_json::from_value(journal.dead_letters[0].data.clone()).unwrap();
    assert_eq!(dead, message("taxi 20"));
    factory.close().await.unwrap();
}

#[tokio::test]
async fn response_job_schedules_bot_responses() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let responses = ResponseSendingJob::new(&factory, RESPONSES);

    responses
        .schedule_response(&BotResponse {
            chat_id: 3,
            text: "Saved 12.00 under Food".to_string(),
            reply_to_message_id: None,
        })
        .await
        .unwrap();

    let journal = backend.journal(RESPONSES).await;
    assert_eq!(
        journal.published[0].data,
        json!({"chatId": 3, "text": "Saved 12.00 under Food", "replyToMessageId": null})
    );
}
