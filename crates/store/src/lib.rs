//! `relaykit-store` — the durable Outbox Store.
//!
//! One logical table (name passed as a runtime parameter to every
//! operation), potentially replicated across N physical shards addressed
//! by a `shard_id` column. Two implementations:
//!
//! - [`InMemoryOutboxStore`] for tests/dev,
//! - [`PgOutboxStore`] on PostgreSQL via sqlx, using
//!   `FOR UPDATE SKIP LOCKED` for the contention-safe claim.

pub mod in_memory;
pub mod postgres;
#[path = "trait.rs"]
pub mod r#trait;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;
pub use r#trait::{DeadLetterFilter, OutboxStore, StoreError};
