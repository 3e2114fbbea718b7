//! Outbox message model: one durable send job per (attempt, channel).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Outbox message status. `pending` rows with `available_at <= now` are
/// claimable; `processing` rows belong to exactly one caller until it
/// reports sent/retry/dead-letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => OutboxStatus::Processing,
            "sent" => OutboxStatus::Sent,
            "dead_letter" => OutboxStatus::DeadLetter,
            _ => OutboxStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::DeadLetter)
    }
}

/// Per-channel send job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxMessage {
    pub message_id: Uuid,
    pub run_id: Uuid,
    pub attempt_id: Uuid,
    pub invoice_id: String,
    pub channel: String,
    pub recipient: Option<String>,
    pub masked_recipient: Option<String>,
    pub payload: serde_json::Value,
    pub status: String,
    pub tries: i32,
    pub available_at: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn status_enum(&self) -> OutboxStatus {
        OutboxStatus::from_string(&self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_terminal()
    }
}
