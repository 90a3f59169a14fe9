//! Backlog monitoring: periodic pending-count samples per shard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use relaykit_store::OutboxStore;

/// Backlog above this triggers a warn-level log per shard.
pub const DEFAULT_WARN_THRESHOLD: u64 = 1_000;

pub struct BacklogMonitor {
    store: Arc<dyn OutboxStore>,
    table: String,
    shard_count: i32,
    interval: Duration,
    warn_threshold: u64,
}

impl BacklogMonitor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        table: impl Into<String>,
        shard_count: i32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            shard_count,
            interval,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }

    pub fn with_warn_threshold(mut self, threshold: u64) -> Self {
        self.warn_threshold = threshold;
        self
    }

    /// Sample every shard's claimable backlog once.
    pub async fn sample_at(&self, now: DateTime<Utc>) -> Vec<u64> {
        let mut samples = Vec::with_capacity(self.shard_count as usize);
        for shard_id in 0..self.shard_count {
            match self.store.count_pending(&self.table, shard_id, now).await {
                Ok(pending) => {
                    if pending >= self.warn_threshold {
                        warn!(table = %self.table, shard_id, pending, "outbox backlog high");
                    } else {
                        debug!(table = %self.table, shard_id, pending, "outbox backlog");
                    }
                    samples.push(pending);
                }
                Err(err) => {
                    error!(table = %self.table, shard_id, error = %err, "backlog sample failed");
                    samples.push(0);
                }
            }
        }
        samples
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sample_at(Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaykit_core::NewOutboxRecord;
    use relaykit_store::InMemoryOutboxStore;

    #[tokio::test]
    async fn samples_count_claimable_records_per_shard() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let now = Utc::now();
        for shard_id in [0, 0, 1] {
            store
                .insert(
                    "outbox",
                    NewOutboxRecord {
                        shard_id,
                        kind: "SEND_EMAIL".to_string(),
                        biz_key: "k".to_string(),
                        sharding_key: "k".to_string(),
                        topic: None,
                        tag: None,
                        message_key: None,
                        payload: "{}".to_string(),
                    },
                    now,
                )
                .await
                .unwrap();
        }

        let monitor = BacklogMonitor::new(store, "outbox", 3, Duration::from_secs(60));
        assert_eq!(monitor.sample_at(now).await, vec![2, 1, 0]);
    }
}
