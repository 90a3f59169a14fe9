//! Retention cleanup.
//!
//! Deletes terminal records past their retention window, walking shard-id
//! ranges in chunks so no single DELETE touches the whole table.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use relaykit_store::OutboxStore;

use crate::config::RelayConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub sent_deleted: u64,
    pub dead_deleted: u64,
}

pub struct CleanupTask {
    store: Arc<dyn OutboxStore>,
    config: RelayConfig,
}

impl CleanupTask {
    pub fn new(store: Arc<dyn OutboxStore>, config: RelayConfig) -> Self {
        Self { store, config }
    }

    /// One retention pass at the given instant. Range failures are
    /// logged and skipped; the next pass retries them.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> CleanupStats {
        let table = &self.config.table;
        let sent_cutoff = now - chrono::Duration::days(self.config.sent_retention_days);
        let dead_cutoff = now - chrono::Duration::days(self.config.dead_retention_days);

        let mut stats = CleanupStats::default();
        let mut shard_start = 0;
        while shard_start < self.config.shard_count {
            let shard_end = (shard_start + self.config.cleanup_shard_batch)
                .min(self.config.shard_count);

            match self
                .store
                .delete_sent_before(table, shard_start, shard_end, sent_cutoff)
                .await
            {
                Ok(deleted) => stats.sent_deleted += deleted,
                Err(err) => {
                    error!(shard_start, shard_end, error = %err, "sent cleanup failed")
                }
            }
            match self
                .store
                .delete_dead_before(table, shard_start, shard_end, dead_cutoff)
                .await
            {
                Ok(deleted) => stats.dead_deleted += deleted,
                Err(err) => {
                    error!(shard_start, shard_end, error = %err, "dead cleanup failed")
                }
            }

            shard_start = shard_end;
        }

        if stats.sent_deleted > 0 || stats.dead_deleted > 0 {
            info!(
                table = %table,
                sent_deleted = stats.sent_deleted,
                dead_deleted = stats.dead_deleted,
                "retention cleanup complete"
            );
        }
        stats
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_once_at(Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaykit_core::{NewOutboxRecord, OutboxStatus};
    use relaykit_store::InMemoryOutboxStore;

    async fn seed_terminal(
        store: &InMemoryOutboxStore,
        shard_id: i32,
        status: OutboxStatus,
        created: DateTime<Utc>,
    ) -> i64 {
        let rec = store
            .insert(
                "outbox",
                NewOutboxRecord {
                    shard_id,
                    kind: "SEND_EMAIL".to_string(),
                    biz_key: "order-1".to_string(),
                    sharding_key: "order-1".to_string(),
                    topic: None,
                    tag: None,
                    message_key: None,
                    payload: "{}".to_string(),
                },
                created,
            )
            .await
            .unwrap();
        store
            .claim_batch("outbox", shard_id, "i", created + chrono::Duration::seconds(30), created, 1)
            .await
            .unwrap();
        match status {
            OutboxStatus::Sent => {
                store.mark_sent("outbox", rec.id, "i", created).await.unwrap();
            }
            OutboxStatus::Dead => {
                store
                    .mark_dead("outbox", rec.id, "i", "err", created)
                    .await
                    .unwrap();
            }
            other => panic!("not a terminal status: {other}"),
        }
        rec.id
    }

    #[tokio::test]
    async fn deletes_expired_terminal_records_only() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let now = Utc::now();

        let old_sent = seed_terminal(&store, 0, OutboxStatus::Sent, now - chrono::Duration::days(8)).await;
        let fresh_sent = seed_terminal(&store, 1, OutboxStatus::Sent, now - chrono::Duration::days(2)).await;
        let old_dead = seed_terminal(&store, 2, OutboxStatus::Dead, now - chrono::Duration::days(91)).await;
        let fresh_dead = seed_terminal(&store, 0, OutboxStatus::Dead, now - chrono::Duration::days(30)).await;

        let mut config = RelayConfig::default();
        config.cleanup_shard_batch = 2; // force two range chunks over 3 shards
        let task = CleanupTask::new(store.clone(), config);

        let stats = task.run_once_at(now).await;
        assert_eq!(stats.sent_deleted, 1);
        assert_eq!(stats.dead_deleted, 1);

        assert!(store.get("outbox", 0, old_sent).await.unwrap().is_none());
        assert!(store.get("outbox", 1, fresh_sent).await.unwrap().is_some());
        assert!(store.get("outbox", 2, old_dead).await.unwrap().is_none());
        assert!(store.get("outbox", 0, fresh_dead).await.unwrap().is_some());
    }
}
