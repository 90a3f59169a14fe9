//! `relaykit-core` — domain foundation of the outbox relay.
//!
//! This crate contains **pure domain** types (no storage or transport
//! concerns): the outbox record, its status state machine, the retry
//! backoff policy, and worker instance identity.

pub mod backoff;
pub mod error;
pub mod identity;
pub mod record;
pub mod status;

pub use backoff::BackoffPolicy;
pub use error::ValidationError;
pub use identity::InstanceId;
pub use record::{truncate_error, NewOutboxRecord, OutboxRecord, MAX_ERROR_LEN};
pub use status::OutboxStatus;
