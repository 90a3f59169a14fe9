//! Dead-letter notifications.

use serde::{Deserialize, Serialize};
use tracing::error;

use relaykit_core::OutboxRecord;

/// Bound on the payload excerpt carried in notifications.
pub const PAYLOAD_PREVIEW_LEN: usize = 200;

/// Snapshot of a record at the moment it exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub shard_id: i32,
    pub kind: String,
    pub biz_key: String,
    /// Name of the handler whose final attempt failed.
    pub handler: String,
    pub retry_count: i32,
    pub last_error: String,
    pub payload_preview: String,
}

impl DeadLetter {
    pub fn from_record(record: &OutboxRecord, handler: &str, last_error: &str) -> Self {
        Self {
            id: record.id,
            shard_id: record.shard_id,
            kind: record.kind.clone(),
            biz_key: record.biz_key.clone(),
            handler: handler.to_string(),
            retry_count: record.retry_count,
            last_error: last_error.to_string(),
            payload_preview: record.payload_preview(PAYLOAD_PREVIEW_LEN),
        }
    }
}

/// Receives exactly one notification per record that goes `Dead` (the
/// owner-guarded update makes the transition race-free, so only the
/// instance that won it notifies).
pub trait DeadLetterSink: Send + Sync {
    fn notify(&self, dead: &DeadLetter);
}

/// Default sink: a structured error log. Deployments wanting paging or
/// tickets plug in their own sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetterSink;

impl DeadLetterSink for LogDeadLetterSink {
    fn notify(&self, dead: &DeadLetter) {
        error!(
            id = dead.id,
            shard_id = dead.shard_id,
            kind = %dead.kind,
            biz_key = %dead.biz_key,
            handler = %dead.handler,
            retry_count = dead.retry_count,
            last_error = %dead.last_error,
            payload_preview = %dead.payload_preview,
            "outbox record dead-lettered"
        );
    }
}
