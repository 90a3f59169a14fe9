//! Claiming: moving eligible records into this instance's lease.

use chrono::{DateTime, Duration, Utc};

use relaykit_core::{InstanceId, OutboxRecord, OutboxStatus};
use relaykit_store::{OutboxStore, StoreError};

/// Owns the process identity and composes the two-phase claim. Winning
/// fewer rows than requested (including zero) is the normal outcome
/// under contention, never an error.
#[derive(Debug, Clone)]
pub struct ClaimService {
    instance_id: InstanceId,
    lease: Duration,
    batch_size: u32,
}

impl ClaimService {
    pub fn new(instance_id: InstanceId, lease: Duration, batch_size: u32) -> Self {
        Self {
            instance_id,
            lease,
            batch_size,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn owner(&self) -> &str {
        self.instance_id.as_str()
    }

    /// Claim up to the configured batch from one shard.
    pub async fn claim_batch(
        &self,
        store: &dyn OutboxStore,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        store
            .claim_batch(
                table,
                shard_id,
                self.owner(),
                now + self.lease,
                now,
                self.batch_size,
            )
            .await
    }

    /// Claim one specific record (kick path). `None` when the record is
    /// no longer eligible or a concurrent instance won it.
    pub async fn claim_one(
        &self,
        store: &dyn OutboxStore,
        table: &str,
        shard_id: i32,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        let won = store
            .claim_by_ids(table, shard_id, &[id], self.owner(), now + self.lease, now)
            .await?;
        if won == 0 {
            return Ok(None);
        }

        let loaded = store.load_by_ids(table, shard_id, &[id]).await?;
        Ok(loaded.into_iter().find(|r| {
            r.status == OutboxStatus::Processing && r.lock_owner.as_deref() == Some(self.owner())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaykit_core::NewOutboxRecord;
    use relaykit_store::InMemoryOutboxStore;

    fn service(name: &str) -> ClaimService {
        ClaimService::new(
            InstanceId::from_string(name.to_string()),
            Duration::seconds(30),
            50,
        )
    }

    #[tokio::test]
    async fn claim_one_wins_then_loses() {
        let store = InMemoryOutboxStore::new();
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

        let first = service("inst-a")
            .claim_one(&store, "outbox", 0, rec.id, now)
            .await
            .unwrap();
        assert_eq!(first.unwrap().lock_owner.as_deref(), Some("inst-a"));

        // Already leased: a second claim sees nothing eligible.
        let second = service("inst-b")
            .claim_one(&store, "outbox", 0, rec.id, now)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
