//! Stuck-record recovery.
//!
//! A crashed or partitioned instance leaves records in `Processing` with
//! a lease that eventually expires. This task folds them back into the
//! ordinary retry path instead of a special resurrection flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use relaykit_store::{OutboxStore, StoreError};

pub struct RecoveryTask {
    store: Arc<dyn OutboxStore>,
    table: String,
    interval: Duration,
}

impl RecoveryTask {
    pub fn new(store: Arc<dyn OutboxStore>, table: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            table: table.into(),
            interval,
        }
    }

    /// Reset every record whose lease expired before `now`. Returns the
    /// number recovered.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let recovered = self.store.recover_stuck(&self.table, now).await?;
        if recovered > 0 {
            info!(table = %self.table, recovered, "recovered stuck records");
        }
        Ok(recovered)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.run_once_at(Utc::now()).await {
                        error!(table = %self.table, error = %err, "recovery pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use relaykit_core::{NewOutboxRecord, OutboxStatus};
    use relaykit_store::InMemoryOutboxStore;

    #[tokio::test]
    async fn expired_leases_are_recovered() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let now = Utc::now();
        let rec = store
            .insert(
                "outbox",
                NewOutboxRecord {
                    shard_id: 0,
                    kind: "SEND_EMAIL".to_string(),
                    biz_key: "order-1".to_string(),
                    sharding_key: "order-1".to_string(),
                    topic: None,
                    tag: None,
                    message_key: None,
                    payload: "{}".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        store
            .claim_batch("outbox", 0, "crashed-instance", now + ChronoDuration::seconds(30), now, 1)
            .await
            .unwrap();

        let task = RecoveryTask::new(store.clone(), "outbox", Duration::from_secs(10));

        // Lease still live.
        assert_eq!(task.run_once_at(now).await.unwrap(), 0);

        let later = now + ChronoDuration::seconds(31);
        assert_eq!(task.run_once_at(later).await.unwrap(), 1);

        let after = store.get("outbox", 0, rec.id).await.unwrap().unwrap();
        assert_eq!(after.status, OutboxStatus::Failed);
        assert_eq!(after.next_retry_time, Some(later));
        assert!(after.lock_owner.is_none());
    }
}
