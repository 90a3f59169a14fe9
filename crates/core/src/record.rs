//! The outbox record: one durable unit of delivery intent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::OutboxStatus;

/// Upper bound on stored error messages.
pub const MAX_ERROR_LEN: usize = 500;

/// A durable row representing one pending or processed message.
///
/// The relay never interprets `payload`; it is an opaque serialized body
/// handed to the matching handler as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic id, unique within a shard.
    pub id: i64,
    /// Physical routing target, fixed at insert time and never recomputed.
    pub shard_id: i32,
    /// Message kind; selects a handler (e.g. `SEND_EMAIL`,
    /// `PAYMENT_SUCCEEDED_MQ`).
    pub kind: String,
    /// Application correlation key, used for idempotency and replay lookups.
    pub biz_key: String,
    /// The key the shard id was derived from; kept for audit/replay.
    pub sharding_key: String,
    /// Broker transport hints; unused by HTTP handlers.
    pub topic: Option<String>,
    pub tag: Option<String>,
    pub message_key: Option<String>,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Lock bookkeeping; non-null exactly while `status == Processing`.
    pub lock_owner: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on the terminal transitions (`Sent` or `Dead`).
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Bounded payload excerpt for logs and dead-letter notifications.
    pub fn payload_preview(&self, max: usize) -> String {
        truncate_chars(&self.payload, max)
    }
}

/// Insert-shape of an outbox record; the store assigns id, status and
/// bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub shard_id: i32,
    pub kind: String,
    pub biz_key: String,
    pub sharding_key: String,
    pub topic: Option<String>,
    pub tag: Option<String>,
    pub message_key: Option<String>,
    pub payload: String,
}

/// Truncate a handler error to the stored bound.
pub fn truncate_error(message: &str) -> String {
    truncate_chars(message, MAX_ERROR_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
