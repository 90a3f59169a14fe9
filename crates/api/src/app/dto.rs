//! Response DTOs and JSON mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relaykit_core::OutboxRecord;
use relaykit_relay::PAYLOAD_PREVIEW_LEN;

/// Operator-facing view of a dead-lettered record. The payload is
/// excerpted, not returned in full; operators fetch the row directly if
/// they need the whole body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterDto {
    pub id: i64,
    pub shard_id: i32,
    pub kind: String,
    pub biz_key: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub payload_preview: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&OutboxRecord> for DeadLetterDto {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            id: record.id,
            shard_id: record.shard_id,
            kind: record.kind.clone(),
            biz_key: record.biz_key.clone(),
            retry_count: record.retry_count,
            last_error: record.last_error.clone(),
            payload_preview: record.payload_preview(PAYLOAD_PREVIEW_LEN),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub replayed: u64,
}
