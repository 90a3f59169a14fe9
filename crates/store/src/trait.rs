//! Store contract for the outbox relay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use relaykit_core::{NewOutboxRecord, OutboxRecord, OutboxStatus, ValidationError};

/// Storage-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Rejected dynamic table name (or other validated input).
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    /// A database constraint fired (e.g. duplicate insert).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Connection/query failure; retryable from the caller's perspective.
    #[error("storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

/// Filter for the dead-letter listing surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub kind: Option<String>,
    pub biz_key: Option<String>,
}

/// The durable Outbox Store.
///
/// Every operation takes the logical table name as an explicit runtime
/// parameter so one store instance can serve several outbox tables
/// (`order_outbox`, `stock_outbox`, ...) regardless of physical
/// partitioning. Operations also take `now` explicitly, which keeps the
/// eligibility/lease predicates testable with fake clocks.
///
/// All multi-instance coordination goes through this interface: the
/// two-phase claim and the owner-guarded terminal updates are the only
/// write paths for non-terminal records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new record in `New` state. The Postgres implementation
    /// additionally offers [`crate::PgOutboxStore::insert_with`] to insert
    /// inside the caller's open business transaction.
    async fn insert(
        &self,
        table: &str,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, StoreError>;

    async fn get(
        &self,
        table: &str,
        shard_id: i32,
        id: i64,
    ) -> Result<Option<OutboxRecord>, StoreError>;

    /// Claim phase 1: ids of up to `limit` eligible records on one shard,
    /// oldest first. Eligible means claimable status (`New`/`Failed`),
    /// retry time elapsed, and no live lease. Implementations backed by a
    /// locking store skip rows locked by concurrent readers.
    async fn select_ids_for_claim(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<i64>, StoreError>;

    /// Claim phase 2: move the given ids to `Processing` under `owner`
    /// with a lease until `lock_until`, re-checking the full eligibility
    /// predicate (it may have changed since phase 1). Returns the number
    /// of rows actually won; fewer than `ids.len()` is a normal outcome
    /// under contention, never an error.
    async fn claim_by_ids(
        &self,
        table: &str,
        shard_id: i32,
        ids: &[i64],
        owner: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Claim phase 3: load full records by id.
    async fn load_by_ids(
        &self,
        table: &str,
        shard_id: i32,
        ids: &[i64],
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Two-phase claim: select, claim, load. The default composes the
    /// three phases as separate calls — correct because phase 2 re-checks
    /// eligibility, merely more contended. The Postgres implementation
    /// overrides this to hold one transaction across the phases so
    /// `FOR UPDATE SKIP LOCKED` partitions concurrent scanners.
    async fn claim_batch(
        &self,
        table: &str,
        shard_id: i32,
        owner: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let ids = self
            .select_ids_for_claim(table, shard_id, now, limit)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.claim_by_ids(table, shard_id, &ids, owner, lock_until, now)
            .await?;

        // Keep only the rows this owner actually won; a concurrent
        // instance may have taken some between the phases.
        let loaded = self.load_by_ids(table, shard_id, &ids).await?;
        Ok(loaded
            .into_iter()
            .filter(|r| {
                r.status == OutboxStatus::Processing && r.lock_owner.as_deref() == Some(owner)
            })
            .collect())
    }

    /// Guarded terminal update: `Processing -> Sent`, sets `completed_at`.
    /// Returns false when the guard misses (lease lost to a newer claim).
    async fn mark_sent(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Guarded `Processing -> Failed` with retry bookkeeping.
    async fn mark_failed(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        retry_count: i32,
        next_retry_time: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Guarded `Processing -> Dead`, sets `completed_at`.
    async fn mark_dead(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Guarded `Processing -> New` with lock fields and `next_retry_time`
    /// cleared; used when no registered handler supports the record's kind.
    async fn release_lock(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Renew a live lease (slow handler keep-alive). Fails the guard when
    /// the lease already expired or changed owner.
    async fn extend_lock(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Reset every `Processing` record whose lease expired to `Failed`
    /// with `next_retry_time = now`, folding crash recovery into the
    /// ordinary retry path. Appends a lease-expired note to `last_error`.
    async fn recover_stuck(&self, table: &str, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Manual replay: `Dead -> New`, clearing retry bookkeeping. A no-op
    /// (returns false) for records in any other state.
    async fn reset_dead_to_new(
        &self,
        table: &str,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Operator listing of dead-lettered records, newest activity first.
    async fn list_dead_letters(
        &self,
        table: &str,
        filter: &DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// All dead records for a correlation key (replay-by-bizKey surface).
    async fn find_dead_by_biz_key(
        &self,
        table: &str,
        biz_key: &str,
        kind: Option<&str>,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Retention: delete `Sent` records created before `cutoff`, limited
    /// to `shard_start..shard_end` to bound transaction size.
    async fn delete_sent_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Retention: same for `Dead` records.
    async fn delete_dead_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Currently claimable records on a shard (backlog monitoring).
    async fn count_pending(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
