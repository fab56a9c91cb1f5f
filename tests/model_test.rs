use expensio::model::envelope::DEFAULT_MAX_RETRIES;
use expensio::model::message::{BotResponse, IncomingMessage};
use expensio::model::{TaskEnvelope, TaskResult, TaskStatus};
use serde_json::json;

#[test]
fn envelope_wire_shape_is_camel_case() {
    let envelope = TaskEnvelope::new(json!({"chatId": 1}), 3);
    let value = serde_json::to_value(&envelope).unwrap();

    let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["attempts", "data", "id", "maxRetries"]);
    assert_eq!(value["attempts"], 0);
    assert_eq!(value["maxRetries"], 3);
    assert_eq!(value["data"], json!({"chatId": 1}));
}

#[test]
fn envelope_ids_are_timestamp_plus_suffix_and_unique() {
    let a = TaskEnvelope::new(json!(null), 3);
    let b = TaskEnvelope::new(json!(null), 3);
    assert_ne!(a.id, b.id);

    let (millis, suffix) = a.id.split_once('-').unwrap();
    assert!(millis.parse::<i64>().unwrap() > 0);
    assert_eq!(suffix.len(), 9);
}

#[test]
fn decode_accepts_legacy_msg_id_and_missing_attempts() {
    let envelope =
        TaskEnvelope::decode(br#"{"msgId":"123-abcdefghi","data":[1,2],"maxRetries":5}"#).unwrap();
    assert_eq!(envelope.id, "123-abcdefghi");
    assert_eq!(envelope.attempts, 0);
    assert_eq!(envelope.max_retries, 5);
    assert_eq!(envelope.data, json!([1, 2]));
}

#[test]
fn decode_defaults_a_missing_retry_ceiling() {
    let envelope =
        TaskEnvelope::decode(br#"{"msgId":"123-abcdefghi","data":{},"attempts":1}"#).unwrap();
    assert_eq!(envelope.max_retries, DEFAULT_MAX_RETRIES);
    assert_eq!(envelope.attempts, 1);
}

#[test]
fn decode_rejects_bodies_that_are_not_envelopes() {
    assert!(TaskEnvelope::decode(b"not json").is_err());
    assert!(TaskEnvelope::decode(br#"{"data":{}}"#).is_err());
    assert!(TaskEnvelope::decode(br#"{"id":"x","data":{},"attempts":-1,"maxRetries":3}"#).is_err());
}

#[test]
fn record_failure_reports_exhaustion_at_the_ceiling() {
    let mut envelope = TaskEnvelope::new(json!({}), 3);
    assert!(!envelope.record_failure());
    assert!(!envelope.record_failure());
    assert!(envelope.record_failure());
    assert_eq!(envelope.attempts, 3);
    assert!(envelope.is_exhausted());
}

#[test]
fn encode_then_decode_preserves_attempts() {
    let mut envelope = TaskEnvelope::new(json!({"k": "v"}), 4);
    envelope.record_failure();
    let decoded = TaskEnvelope::decode(&envelope.encode().unwrap()).unwrap();
    assert_eq!(decoded, envelope);
}

#[test]
fn task_result_constructors_and_status_names() {
    assert_eq!(TaskResult::success("ok").status, TaskStatus::Success);
    assert_eq!(TaskResult::cancelled("skip").status, TaskStatus::Cancelled);

    let failed = TaskResult::from_result::<(), _>(Err("db down"));
    assert_eq!(failed.status, TaskStatus::Error);
    assert_eq!(failed.message.as_deref(), Some("db down"));
    assert_eq!(TaskResult::from_result::<_, String>(Ok(1)).status, TaskStatus::Success);

    assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    assert_eq!(serde_json::to_value(TaskStatus::Error).unwrap(), json!("error"));
}

#[test]
fn chat_payloads_use_camel_case() {
    let message: IncomingMessage = serde_json::from_value(json!({
        "telegramUserId": 42,
        "chatId": 7,
        "messageText": "coffee 3.50",
        "timestamp": "2025-08-22T10:00:00Z",
        "messageId": 99,
    }))
    .unwrap();
    assert_eq!(message.telegram_user_id, 42);
    assert_eq!(message.message_text, "coffee 3.50");

    let response = BotResponse {
        chat_id: 7,
        text: "Saved".to_string(),
        reply_to_message_id: Some(99),
    };
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"chatId": 7, "text": "Saved", "replyToMessageId": 99})
    );
}
