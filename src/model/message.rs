//! Chat payloads carried by the bot's two queues.

use serde::{Deserialize, Serialize};

/// An inbound Telegram message, as scheduled by the ingest side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub telegram_user_id: i64,
    pub chat_id: i64,
    pub message_text: String,
    /// ISO-8601 timestamp as sent by the connector. Kept verbatim.
    pub timestamp: String,
    pub message_id: i64,
}

/// An outbound reply for the connector to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotResponse {
    pub chat_id: i64,
    pub text: String,
    pub reply_to_message_id: Option<i64>,
}
