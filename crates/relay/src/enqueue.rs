//! Enqueue surface for producers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use relaykit_core::{NewOutboxRecord, OutboxRecord, ValidationError};
use relaykit_store::{OutboxStore, StoreError};

use crate::dispatcher::Kick;
use crate::router::ShardRouter;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One message to enqueue. A non-empty `sharding_key` is required — an
/// unroutable record is rejected rather than silently defaulted. An
/// explicit `shard_id` bypasses the router entirely.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: String,
    pub biz_key: String,
    pub sharding_key: Option<String>,
    pub shard_id: Option<i32>,
    pub topic: Option<String>,
    pub tag: Option<String>,
    pub message_key: Option<String>,
    pub payload: String,
}

impl EnqueueRequest {
    pub fn new(
        kind: impl Into<String>,
        biz_key: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            biz_key: biz_key.into(),
            sharding_key: None,
            shard_id: None,
            topic: None,
            tag: None,
            message_key: None,
            payload: payload.into(),
        }
    }

    pub fn sharding_key(mut self, key: impl Into<String>) -> Self {
        self.sharding_key = Some(key.into());
        self
    }

    pub fn shard_id(mut self, shard_id: i32) -> Self {
        self.shard_id = Some(shard_id);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = Some(key.into());
        self
    }
}

/// Producer-side entry point: validates, routes to a shard, writes the
/// record, and nudges the local dispatcher.
///
/// Callers that need the write to be atomic with their own business
/// transaction use [`Enqueuer::prepare`] to get the routed
/// [`NewOutboxRecord`], insert it through the store's
/// transaction-capable path themselves, and call [`Enqueuer::kick`]
/// after commit.
pub struct Enqueuer {
    store: Arc<dyn OutboxStore>,
    router: Arc<dyn ShardRouter>,
    table: String,
    kick_tx: Option<mpsc::Sender<Kick>>,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        router: Arc<dyn ShardRouter>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            router,
            table: table.into(),
            kick_tx: None,
        }
    }

    pub fn with_kick(mut self, kick_tx: mpsc::Sender<Kick>) -> Self {
        self.kick_tx = Some(kick_tx);
        self
    }

    /// Validate and route a request into its insert shape without
    /// touching storage.
    pub fn prepare(&self, request: EnqueueRequest) -> Result<NewOutboxRecord, EnqueueError> {
        let sharding_key = match request.sharding_key {
            Some(key) if !key.is_empty() => key,
            _ => return Err(ValidationError::EmptyShardingKey.into()),
        };

        let shard_count = self.router.shard_count();
        let shard_id = match request.shard_id {
            Some(explicit) => {
                if !(0..shard_count).contains(&explicit) {
                    return Err(ValidationError::ShardOutOfRange {
                        shard_id: explicit,
                        shard_count: shard_count.max(0) as u32,
                    }
                    .into());
                }
                explicit
            }
            None => self.router.shard_for(&sharding_key),
        };

        Ok(NewOutboxRecord {
            shard_id,
            kind: request.kind,
            biz_key: request.biz_key,
            sharding_key,
            topic: request.topic,
            tag: request.tag,
            message_key: request.message_key,
            payload: request.payload,
        })
    }

    /// Standalone enqueue (its own storage transaction).
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, EnqueueError> {
        let record = self.prepare(request)?;
        let inserted = self.store.insert(&self.table, record, now).await?;
        self.kick(inserted.shard_id, inserted.id);
        Ok(inserted)
    }

    /// Nudge the local dispatcher to pick up a freshly committed record
    /// without waiting for the next sweep. Best-effort: a full channel
    /// just means the record rides the polling sweep instead.
    pub fn kick(&self, shard_id: i32, id: i64) {
        if let Some(tx) = &self.kick_tx {
            if tx.try_send(Kick { shard_id, id }).is_err() {
                debug!(shard_id, id, "kick channel full, record will be swept");
            }
        }
    }
}
