//! Postgres-backed outbox store.
//!
//! The claim path relies on `FOR UPDATE SKIP LOCKED`: concurrent relay
//! instances scanning the same shard partition the eligible rows instead
//! of blocking on each other. Correctness does not depend on it — the
//! claim UPDATE re-checks the full eligibility predicate — skip-locked
//! only removes contention.
//!
//! Table names are dynamic (one store serves `order_outbox`,
//! `stock_outbox`, ...) and cannot be bound as SQL parameters, so every
//! name passes [`validate_table_name`] before being interpolated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Row};
use tracing::instrument;

use relaykit_core::{
    error::validate_table_name, truncate_error, NewOutboxRecord, OutboxRecord, OutboxStatus,
    MAX_ERROR_LEN,
};

use super::r#trait::{DeadLetterFilter, OutboxStore, StoreError};

const COLUMNS: &str = "id, shard_id, kind, biz_key, sharding_key, topic, tag, message_key, \
     payload, status, retry_count, next_retry_time, lock_owner, lock_time, lock_until, \
     last_error, created_at, updated_at, completed_at";

const ELIGIBLE: &str = "status IN ('NEW', 'FAILED') \
     AND (next_retry_time IS NULL OR next_retry_time <= $2) \
     AND (lock_until IS NULL OR lock_until < $2)";

/// Postgres implementation of [`OutboxStore`].
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: Arc<PgPool>,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a record through the caller's executor. Passing an open
    /// transaction makes the enqueue atomic with the caller's business
    /// writes, which is the whole point of the outbox pattern; the
    /// record only becomes visible to scanners when that transaction
    /// commits.
    pub async fn insert_with<'e, E>(
        &self,
        executor: E,
        table: &str,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, StoreError>
    where
        E: PgExecutor<'e>,
    {
        validate_table_name(table)?;
        let sql = format!(
            "INSERT INTO {table} \
                 (shard_id, kind, biz_key, sharding_key, topic, tag, message_key, payload, \
                  status, retry_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'NEW', 0, $9, $9) \
             RETURNING {COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(record.shard_id)
            .bind(&record.kind)
            .bind(&record.biz_key)
            .bind(&record.sharding_key)
            .bind(&record.topic)
            .bind(&record.tag)
            .bind(&record.message_key)
            .bind(&record.payload)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        record_from_row(&row, "insert")
    }

    async fn select_ids<'e, E>(
        &self,
        executor: E,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
        limit: u32,
        skip_locked: bool,
    ) -> Result<Vec<i64>, StoreError>
    where
        E: PgExecutor<'e>,
    {
        // SKIP LOCKED only partitions scanners when the rows stay locked
        // until the claim UPDATE, i.e. inside one transaction. The
        // pool-backed trait call locks per-statement, which is harmless.
        let locking = if skip_locked {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        };
        let sql = format!(
            "SELECT id FROM {table} \
             WHERE shard_id = $1 AND {ELIGIBLE} \
             ORDER BY id ASC LIMIT $3{locking}"
        );

        let rows = sqlx::query(&sql)
            .bind(shard_id)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(executor)
            .await
            .map_err(|e| map_sqlx_error("select_ids_for_claim", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("id")
                    .map_err(|e| decode_error("select_ids_for_claim", &e))
            })
            .collect()
    }

    async fn claim_ids<'e, E>(
        &self,
        executor: E,
        table: &str,
        shard_id: i32,
        ids: &[i64],
        owner: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>
    where
        E: PgExecutor<'e>,
    {
        // Re-checks the full eligibility predicate: rows taken by a
        // concurrent instance between the phases simply do not match.
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'PROCESSING', lock_owner = $3, lock_time = $2, \
                 lock_until = $4, updated_at = $2 \
             WHERE shard_id = $1 AND id = ANY($5) AND {ELIGIBLE}"
        );

        let result = sqlx::query(&sql)
            .bind(shard_id)
            .bind(now)
            .bind(owner)
            .bind(lock_until)
            .bind(ids)
            .execute(executor)
            .await
            .map_err(|e| map_sqlx_error("claim_by_ids", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(
        &self,
        table: &str,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord, StoreError> {
        self.insert_with(&*self.pool, table, record, now).await
    }

    async fn get(
        &self,
        table: &str,
        shard_id: i32,
        id: i64,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE shard_id = $1 AND id = $2");

        let row = sqlx::query(&sql)
            .bind(shard_id)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| record_from_row(&r, "get")).transpose()
    }

    async fn select_ids_for_claim(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<i64>, StoreError> {
        validate_table_name(table)?;
        self.select_ids(&*self.pool, table, shard_id, now, limit, false)
            .await
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
        self.claim_ids(&*self.pool, table, shard_id, ids, owner, lock_until, now)
            .await
    }

    async fn load_by_ids(
        &self,
        table: &str,
        shard_id: i32,
        ids: &[i64],
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE shard_id = $1 AND id = ANY($2) ORDER BY id ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(shard_id)
            .bind(ids)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_by_ids", e))?;

        rows.iter()
            .map(|row| record_from_row(row, "load_by_ids"))
            .collect()
    }

    /// One transaction across all three phases, so the `FOR UPDATE SKIP
    /// LOCKED` row locks survive until the claim UPDATE commits and
    /// concurrent scanners see disjoint batches.
    #[instrument(skip(self), fields(table = %table, shard_id, owner = %owner), err)]
    async fn claim_batch(
        &self,
        table: &str,
        shard_id: i32,
        owner: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_begin", e))?;

        let ids = self
            .select_ids(&mut *tx, table, shard_id, now, limit, true)
            .await?;
        if ids.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("claim_rollback", e))?;
            return Ok(Vec::new());
        }

        self.claim_ids(&mut *tx, table, shard_id, &ids, owner, lock_until, now)
            .await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE shard_id = $1 AND id = ANY($2) \
               AND status = 'PROCESSING' AND lock_owner = $3 \
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(shard_id)
            .bind(&ids)
            .bind(owner)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_load", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_commit", e))?;

        rows.iter()
            .map(|row| record_from_row(row, "claim_load"))
            .collect()
    }

    async fn mark_sent(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'SENT', completed_at = $3, updated_at = $3, \
                 lock_owner = NULL, lock_time = NULL, lock_until = NULL \
             WHERE id = $1 AND lock_owner = $2 AND status = 'PROCESSING'"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(owner)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?;

        Ok(result.rows_affected() == 1)
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
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'FAILED', retry_count = $3, next_retry_time = $4, \
                 last_error = $5, updated_at = $6, \
                 lock_owner = NULL, lock_time = NULL, lock_until = NULL \
             WHERE id = $1 AND lock_owner = $2 AND status = 'PROCESSING'"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(owner)
            .bind(retry_count)
            .bind(next_retry_time)
            .bind(truncate_error(last_error))
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(result.rows_affected() == 1)
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
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'DEAD', last_error = $3, completed_at = $4, updated_at = $4, \
                 lock_owner = NULL, lock_time = NULL, lock_until = NULL \
             WHERE id = $1 AND lock_owner = $2 AND status = 'PROCESSING'"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(owner)
            .bind(truncate_error(last_error))
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_dead", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(
        &self,
        table: &str,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'NEW', next_retry_time = NULL, updated_at = $3, \
                 lock_owner = NULL, lock_time = NULL, lock_until = NULL \
             WHERE id = $1 AND lock_owner = $2 AND status = 'PROCESSING'"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(owner)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lock", e))?;

        Ok(result.rows_affected() == 1)
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
        // Renewal only wins while the current lease is still live;
        // otherwise the recovery task may already have reset the row.
        let sql = format!(
            "UPDATE {table} SET lock_until = $3, updated_at = $4 \
             WHERE id = $1 AND lock_owner = $2 AND status = 'PROCESSING' \
               AND lock_until >= $4"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(owner)
            .bind(new_lock_until)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("extend_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn recover_stuck(&self, table: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'FAILED', next_retry_time = $1, \
                 last_error = left(concat_ws(' ', last_error, \
                     '[lease expired at ' || $1::text || ']'), {MAX_ERROR_LEN}), \
                 updated_at = $1, \
                 lock_owner = NULL, lock_time = NULL, lock_until = NULL \
             WHERE status = 'PROCESSING' AND lock_until IS NOT NULL AND lock_until < $1"
        );

        let result = sqlx::query(&sql)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("recover_stuck", e))?;

        Ok(result.rows_affected())
    }

    async fn reset_dead_to_new(
        &self,
        table: &str,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "UPDATE {table} SET \
                 status = 'NEW', retry_count = 0, next_retry_time = NULL, \
                 last_error = NULL, completed_at = NULL, updated_at = $2 \
             WHERE id = $1 AND status = 'DEAD'"
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_dead_to_new", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_dead_letters(
        &self,
        table: &str,
        filter: &DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE status = 'DEAD' \
               AND ($1::text IS NULL OR kind = $1) \
               AND ($2::text IS NULL OR biz_key = $2) \
             ORDER BY updated_at DESC \
             LIMIT $3 OFFSET $4"
        );

        let rows = sqlx::query(&sql)
            .bind(filter.kind.as_deref())
            .bind(filter.biz_key.as_deref())
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| record_from_row(row, "list_dead_letters"))
            .collect()
    }

    async fn find_dead_by_biz_key(
        &self,
        table: &str,
        biz_key: &str,
        kind: Option<&str>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE status = 'DEAD' AND biz_key = $1 \
               AND ($2::text IS NULL OR kind = $2) \
             ORDER BY updated_at DESC"
        );

        let rows = sqlx::query(&sql)
            .bind(biz_key)
            .bind(kind)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_dead_by_biz_key", e))?;

        rows.iter()
            .map(|row| record_from_row(row, "find_dead_by_biz_key"))
            .collect()
    }

    async fn delete_sent_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        delete_before(
            &self.pool,
            table,
            "SENT",
            shard_start,
            shard_end,
            cutoff,
            "delete_sent_before",
        )
        .await
    }

    async fn delete_dead_before(
        &self,
        table: &str,
        shard_start: i32,
        shard_end: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        delete_before(
            &self.pool,
            table,
            "DEAD",
            shard_start,
            shard_end,
            cutoff,
            "delete_dead_before",
        )
        .await
    }

    async fn count_pending(
        &self,
        table: &str,
        shard_id: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT COUNT(*) AS pending FROM {table} \
             WHERE shard_id = $1 AND status IN ('NEW', 'FAILED') \
               AND (next_retry_time IS NULL OR next_retry_time <= $2)"
        );

        let row = sqlx::query(&sql)
            .bind(shard_id)
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_pending", e))?;

        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| decode_error("count_pending", &e))?;
        Ok(pending as u64)
    }
}

async fn delete_before(
    pool: &PgPool,
    table: &str,
    status: &'static str,
    shard_start: i32,
    shard_end: i32,
    cutoff: DateTime<Utc>,
    operation: &'static str,
) -> Result<u64, StoreError> {
    validate_table_name(table)?;
    let sql = format!(
        "DELETE FROM {table} \
         WHERE status = '{status}' AND shard_id >= $1 AND shard_id < $2 \
           AND created_at < $3"
    );

    let result = sqlx::query(&sql)
        .bind(shard_start)
        .bind(shard_end)
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(result.rows_affected())
}

/// Map sqlx errors to [`StoreError`]. Unique violations (`23505`) surface
/// as constraint errors; everything else is a storage failure the relay
/// treats as retryable.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Constraint(message)
            } else {
                StoreError::Storage { operation, message }
            }
        }
        other => StoreError::Storage {
            operation,
            message: other.to_string(),
        },
    }
}

fn decode_error(operation: &'static str, err: &sqlx::Error) -> StoreError {
    StoreError::Storage {
        operation,
        message: format!("failed to decode row: {err}"),
    }
}

// sqlx row type

#[derive(Debug)]
struct OutboxRecordRow {
    id: i64,
    shard_id: i32,
    kind: String,
    biz_key: String,
    sharding_key: String,
    topic: Option<String>,
    tag: Option<String>,
    message_key: Option<String>,
    payload: String,
    status: String,
    retry_count: i32,
    next_retry_time: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    lock_time: Option<DateTime<Utc>>,
    lock_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRecordRow {
            id: row.try_get("id")?,
            shard_id: row.try_get("shard_id")?,
            kind: row.try_get("kind")?,
            biz_key: row.try_get("biz_key")?,
            sharding_key: row.try_get("sharding_key")?,
            topic: row.try_get("topic")?,
            tag: row.try_get("tag")?,
            message_key: row.try_get("message_key")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_time: row.try_get("next_retry_time")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_time: row.try_get("lock_time")?,
            lock_until: row.try_get("lock_until")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn record_from_row(row: &PgRow, operation: &'static str) -> Result<OutboxRecord, StoreError> {
    let row = OutboxRecordRow::from_row(row).map_err(|e| decode_error(operation, &e))?;
    let status = OutboxStatus::parse(&row.status).ok_or_else(|| StoreError::Storage {
        operation,
        message: format!("unknown status '{}' for record {}", row.status, row.id),
    })?;

    Ok(OutboxRecord {
        id: row.id,
        shard_id: row.shard_id,
        kind: row.kind,
        biz_key: row.biz_key,
        sharding_key: row.sharding_key,
        topic: row.topic,
        tag: row.tag,
        message_key: row.message_key,
        payload: row.payload,
        status,
        retry_count: row.retry_count,
        next_retry_time: row.next_retry_time,
        lock_owner: row.lock_owner,
        lock_time: row.lock_time,
        lock_until: row.lock_until,
        last_error: row.last_error,
        created_at: row.created_at,
        updated_at: row.updated_at,
        completed_at: row.completed_at,
    })
}
