//! Idempotency record: client key bound to a request hash and the first
//! recorded response. No TTL; keys live until operator cleanup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    pub run_id: Uuid,
    pub response: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}
