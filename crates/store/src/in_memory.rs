//! In-memory outbox store.
//!
//! Intended for tests/dev. Mirrors the Postgres predicates exactly so the
//! relay's state machine can be exercised without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relaykit_core::{
    error::validate_table_name, truncate_error, NewOutboxRecord, OutboxRecord, OutboxStatus,
};

use super::r#trait::{DeadLetterFilter, OutboxStore, StoreError};

#[derive(Debug, Default)]
struct TableState {
    next_id: i64,
    rows: BTreeMap<i64, OutboxRecord>,
}

/// In-memory implementation of [`OutboxStore`].
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    tables: Mutex<HashMap<String, TableState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&mut TableState) -> T) -> T {
        let mut tables = self.tables.lock().expect("outbox table lock poisoned");
        let state = tables.entry(table.to_string()).or_default();
        f(state)
    }
}

fn is_eligible(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
    record.status.is_claimable()
        && record.next_retry_time.is_none_or(|t| t <= now)
        && record.lock_until.is_none_or(|t| t < now)
}

fn guard_matches(record: &OutboxRecord, owner: &str) -> bool {
    record.status == OutboxStatus::Processing && record.lock_owner.as_deref() == Some(owner)
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(
        &self,
        table: &str,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            state.next_id += 1;
            let row = OutboxRecord {
                id: state.next_id,
                shard_id: record.shard_id,
                kind: record.kind,
                biz_key: record.biz_key,
                sharding_key: record.sharding_key,
                topic: record.topic,
                tag: record.tag,
                message_key: record.message_key,
                payload: record.payload,
                status: OutboxStatus::New,
                retry_count: 0,
                next_retry_time: None,
                lock_owner: None,
                lock_time: None,
                lock_until: None,
                last_error: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            state.rows.insert(row.id, row.clone());
            row
        }))
    }

    async fn get(
        &self,
        table: &str,
        shard_id: i32,
        id: i64,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            state
                .rows
                .get(&id)
                .filter(|r| r.shard_id == shard_id)
                .cloned()
        }))
    }

    async fn select_ids_for_claim(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<i64>, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            // BTreeMap iteration is id-ascending; ids are monotonic per
            // table, so this is oldest-first.
            state
                .rows
                .values()
                .filter(|r| r.shard_id == shard_id && is_eligible(r, now))
                .take(limit as usize)
                .map(|r| r.id)
                .collect()
        }))
    }

    async fn claim_by_ids(
        &self,
        table: &str,
        shard_id: i32,
        ids: &[i64],
        owner: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            let mut claimed = 0;
            for id in ids {
                if let Some(r) = state.rows.get_mut(id) {
                    if r.shard_id == shard_id && is_eligible(r, now) {
                        r.status = OutboxStatus::Processing;
                        r.lock_owner = Some(owner.to_string());
                        r.lock_time = Some(now);
                        r.lock_until = Some(lock_until);
                        r.updated_at = now;
                        claimed += 1;
                    }
                }
            }
            claimed
        }))
    }

    async fn load_by_ids(
        &self,
        table: &str,
        shard_id: i32,
        ids: &[i64],
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            ids.iter()
                .filter_map(|id| state.rows.get(id))
                .filter(|r| r.shard_id == shard_id)
                .cloned()
                .collect()
        }))
    }

    async fn mark_sent(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r) if guard_matches(r, owner) => {
                    r.status = OutboxStatus::Sent;
                    r.lock_owner = None;
                    r.lock_time = None;
                    r.lock_until = None;
                    r.completed_at = Some(now);
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn mark_failed(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        retry_count: i32,
        next_retry_time: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r) if guard_matches(r, owner) => {
                    r.status = OutboxStatus::Failed;
                    r.retry_count = retry_count;
                    r.next_retry_time = Some(next_retry_time);
                    r.last_error = Some(truncate_error(last_error));
                    r.lock_owner = None;
                    r.lock_time = None;
                    r.lock_until = None;
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn mark_dead(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r) if guard_matches(r, owner) => {
                    r.status = OutboxStatus::Dead;
                    r.last_error = Some(truncate_error(last_error));
                    r.lock_owner = None;
                    r.lock_time = None;
                    r.lock_until = None;
                    r.completed_at = Some(now);
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn release_lock(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r) if guard_matches(r, owner) => {
                    r.status = OutboxStatus::New;
                    r.next_retry_time = None;
                    r.lock_owner = None;
                    r.lock_time = None;
                    r.lock_until = None;
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn extend_lock(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r)
                    if guard_matches(r, owner) && r.lock_until.is_some_and(|t| t >= now) =>
                {
                    r.lock_until = Some(new_lock_until);
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn recover_stuck(&self, table: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            let mut recovered = 0;
            for r in state.rows.values_mut() {
                if r.status == OutboxStatus::Processing && r.lock_until.is_some_and(|t| t < now) {
                    r.status = OutboxStatus::Failed;
                    r.next_retry_time = Some(now);
                    let note = format!("[lease expired at {now}]");
                    r.last_error = Some(truncate_error(&match r.last_error.take() {
                        Some(prev) if !prev.is_empty() => format!("{prev} {note}"),
                        _ => note,
                    }));
                    r.lock_owner = None;
                    r.lock_time = None;
                    r.lock_until = None;
                    r.updated_at = now;
                    recovered += 1;
                }
            }
            recovered
        }))
    }

    async fn reset_dead_to_new(
        &self,
        table: &str,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            match state.rows.get_mut(&id) {
                Some(r) if r.status == OutboxStatus::Dead => {
                    r.status = OutboxStatus::New;
                    r.retry_count = 0;
                    r.next_retry_time = None;
                    r.last_error = None;
                    r.completed_at = None;
                    r.updated_at = now;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn list_dead_letters(
        &self,
        table: &str,
        filter: &DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            let mut dead: Vec<_> = state
                .rows
                .values()
                .filter(|r| r.status == OutboxStatus::Dead)
                .filter(|r| filter.kind.as_deref().is_none_or(|k| r.kind == k))
                .filter(|r| filter.biz_key.as_deref().is_none_or(|b| r.biz_key == b))
                .cloned()
                .collect();
            dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            dead.into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect()
        }))
    }

    async fn find_dead_by_biz_key(
        &self,
        table: &str,
        biz_key: &str,
        kind: Option<&str>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let filter = DeadLetterFilter {
            kind: kind.map(str::to_string),
            biz_key: Some(biz_key.to_string()),
        };
        self.list_dead_letters(table, &filter, 0, u32::MAX).await
    }

    async fn delete_sent_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            let before = state.rows.len();
            state.rows.retain(|_, r| {
                !(r.status == OutboxStatus::Sent
                    && r.shard_id >= shard_start
                    && r.shard_id < shard_end
                    && r.created_at < cutoff)
            });
            (before - state.rows.len()) as u64
        }))
    }

    async fn delete_dead_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            let before = state.rows.len();
            state.rows.retain(|_, r| {
                !(r.status == OutboxStatus::Dead
                    && r.shard_id >= shard_start
                    && r.shard_id < shard_end
                    && r.created_at < cutoff)
            });
            (before - state.rows.len()) as u64
        }))
    }

    async fn count_pending(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        Ok(self.with_table(table, |state| {
            state
                .rows
                .values()
                .filter(|r| {
                    r.shard_id == shard_id
                        && r.status.is_claimable()
                        && r.next_retry_time.is_none_or(|t| t <= now)
                })
                .count() as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TABLE: &str = "outbox";

    fn new_record(shard_id: i32, biz_key: &str) -> NewOutboxRecord {
        NewOutboxRecord {
            shard_id,
            kind: "SEND_EMAIL".to_string(),
            biz_key: biz_key.to_string(),
            sharding_key: biz_key.to_string(),
            topic: None,
            tag: None,
            message_key: None,
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_monotonic_ids_and_new_status() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let a = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        let b = store.insert(TABLE, new_record(0, "b"), now).await.unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.status, OutboxStatus::New);
        assert_eq!(a.retry_count, 0);
        assert!(a.next_retry_time.is_none());
        assert!(a.lock_owner.is_none() && a.lock_until.is_none());
    }

    #[tokio::test]
    async fn claim_batch_takes_only_eligible_rows() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        for i in 0..10 {
            store
                .insert(TABLE, new_record(0, &format!("k{i}")), now)
                .await
                .unwrap();
        }
        // A different shard must not be visible to this scan.
        store.insert(TABLE, new_record(1, "other"), now).await.unwrap();

        let claimed = store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 50)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 10);
        for r in &claimed {
            assert_eq!(r.status, OutboxStatus::Processing);
            assert_eq!(r.lock_owner.as_deref(), Some("inst-a"));
            assert_eq!(r.lock_until, Some(lease));
        }

        // Everything on the shard is locked now.
        let again = store
            .claim_batch(TABLE, 0, "inst-b", lease, now, 50)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_partition_the_eligible_set() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryOutboxStore::new());
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        for i in 0..5 {
            store
                .insert(TABLE, new_record(0, &format!("k{i}")), now)
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            store.claim_batch(TABLE, 0, "inst-a", lease, now, 5),
            store.claim_batch(TABLE, 0, "inst-b", lease, now, 5),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        let ids_a: Vec<i64> = a.iter().map(|r| r.id).collect();
        let ids_b: Vec<i64> = b.iter().map(|r| r.id).collect();
        assert!(ids_a.iter().all(|id| !ids_b.contains(id)), "claims overlap");
        assert!(a.len() + b.len() <= 5);
    }

    #[tokio::test]
    async fn failed_records_become_claimable_after_retry_time() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();
        store
            .mark_failed(TABLE, rec.id, "inst-a", 1, now + Duration::seconds(2), "boom", now)
            .await
            .unwrap();

        // Not yet due.
        let none = store
            .claim_batch(TABLE, 0, "inst-a", lease, now + Duration::seconds(1), 1)
            .await
            .unwrap();
        assert!(none.is_empty());

        let later = now + Duration::seconds(3);
        let due = store
            .claim_batch(TABLE, 0, "inst-a", later + Duration::seconds(30), later, 1)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
    }

    #[tokio::test]
    async fn release_clears_retry_schedule_along_with_the_lock() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();
        store
            .mark_failed(TABLE, rec.id, "inst-a", 1, now + Duration::seconds(2), "boom", now)
            .await
            .unwrap();

        // Re-claim once the retry is due, then release it back.
        let later = now + Duration::seconds(3);
        store
            .claim_batch(TABLE, 0, "inst-a", later + Duration::seconds(30), later, 1)
            .await
            .unwrap();
        assert!(store
            .release_lock(TABLE, rec.id, "inst-a", later)
            .await
            .unwrap());

        let released = store.get(TABLE, 0, rec.id).await.unwrap().unwrap();
        assert_eq!(released.status, OutboxStatus::New);
        assert!(released.next_retry_time.is_none());
        assert!(released.lock_owner.is_none() && released.lock_until.is_none());
    }

    #[tokio::test]
    async fn guarded_updates_miss_for_wrong_owner() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();

        assert!(!store.mark_sent(TABLE, rec.id, "inst-b", now).await.unwrap());
        assert!(store.mark_sent(TABLE, rec.id, "inst-a", now).await.unwrap());

        let sent = store.get(TABLE, 0, rec.id).await.unwrap().unwrap();
        assert_eq!(sent.status, OutboxStatus::Sent);
        assert!(sent.completed_at.is_some());
        assert!(sent.lock_owner.is_none() && sent.lock_until.is_none());

        // Terminal rows reject further guarded updates.
        assert!(!store.mark_sent(TABLE, rec.id, "inst-a", now).await.unwrap());
    }

    #[tokio::test]
    async fn recover_stuck_folds_expired_leases_into_retry_path() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();

        // Lease still live: nothing recovered.
        assert_eq!(store.recover_stuck(TABLE, now).await.unwrap(), 0);

        let after_expiry = lease + Duration::seconds(1);
        assert_eq!(store.recover_stuck(TABLE, after_expiry).await.unwrap(), 1);

        let recovered = store.get(TABLE, 0, rec.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, OutboxStatus::Failed);
        assert_eq!(recovered.next_retry_time, Some(after_expiry));
        assert!(recovered.lock_owner.is_none());
        assert!(recovered
            .last_error
            .as_deref()
            .unwrap()
            .contains("lease expired"));
    }

    #[tokio::test]
    async fn extend_lock_requires_live_lease() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();

        let renewed = lease + Duration::seconds(30);
        assert!(store
            .extend_lock(TABLE, rec.id, "inst-a", renewed, now)
            .await
            .unwrap());

        // After expiry the renewal guard misses.
        let late = renewed + Duration::seconds(1);
        assert!(!store
            .extend_lock(TABLE, rec.id, "inst-a", late + Duration::seconds(30), late)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn replay_resets_only_dead_records() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        let rec = store.insert(TABLE, new_record(0, "a"), now).await.unwrap();

        // Not dead yet: no-op.
        assert!(!store.reset_dead_to_new(TABLE, rec.id, now).await.unwrap());

        store
            .claim_batch(TABLE, 0, "inst-a", lease, now, 1)
            .await
            .unwrap();
        store
            .mark_dead(TABLE, rec.id, "inst-a", "gave up", now)
            .await
            .unwrap();

        assert!(store.reset_dead_to_new(TABLE, rec.id, now).await.unwrap());
        let replayed = store.get(TABLE, 0, rec.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, OutboxStatus::New);
        assert_eq!(replayed.retry_count, 0);
        assert!(replayed.next_retry_time.is_none());
        assert!(replayed.last_error.is_none());
        assert!(replayed.completed_at.is_none());
    }

    #[tokio::test]
    async fn retention_deletes_by_status_shard_range_and_age() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let old = now - Duration::days(10);
        let lease = old + Duration::seconds(30);

        let sent = store.insert(TABLE, new_record(0, "sent"), old).await.unwrap();
        store.claim_batch(TABLE, 0, "i", lease, old, 1).await.unwrap();
        store.mark_sent(TABLE, sent.id, "i", old).await.unwrap();

        let fresh = store.insert(TABLE, new_record(0, "fresh"), now).await.unwrap();
        store
            .claim_batch(TABLE, 0, "i", now + Duration::seconds(30), now, 1)
            .await
            .unwrap();
        store.mark_sent(TABLE, fresh.id, "i", now).await.unwrap();

        let cutoff = now - Duration::days(7);
        assert_eq!(
            store.delete_sent_before(TABLE, 0, 3, cutoff).await.unwrap(),
            1
        );
        assert!(store.get(TABLE, 0, sent.id).await.unwrap().is_none());
        assert!(store.get(TABLE, 0, fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_letter_listing_filters_and_paginates() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        for i in 0..3 {
            let mut rec = new_record(0, "order-42");
            if i == 2 {
                rec.kind = "DEDUCT_STOCK_HTTP".to_string();
                rec.biz_key = "order-7".to_string();
            }
            let inserted = store.insert(TABLE, rec, now).await.unwrap();
            store
                .claim_batch(TABLE, 0, "i", now + Duration::seconds(30), now, 10)
                .await
                .unwrap();
            store
                .mark_dead(TABLE, inserted.id, "i", "err", now)
                .await
                .unwrap();
        }

        let all = store
            .list_dead_letters(TABLE, &DeadLetterFilter::default(), 0, 50)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let by_kind = store
            .list_dead_letters(
                TABLE,
                &DeadLetterFilter {
                    kind: Some("SEND_EMAIL".to_string()),
                    biz_key: None,
                },
                0,
                50,
            )
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 2);

        let by_key = store.find_dead_by_biz_key(TABLE, "order-7", None).await.unwrap();
        assert_eq!(by_key.len(), 1);
        assert_eq!(by_key[0].kind, "DEDUCT_STOCK_HTTP");

        let paged = store
            .list_dead_letters(TABLE, &DeadLetterFilter::default(), 2, 50)
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }
}
