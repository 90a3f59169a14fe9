//! `relaykit-relay` — the relay engine over the outbox store.
//!
//! Producers enqueue through [`Enqueuer`]; the [`Dispatcher`] claims
//! records shard by shard, dispatches them to registered
//! [`OutboxHandler`]s, and drives the retry/dead-letter state machine.
//! [`RecoveryTask`] resets expired leases and [`CleanupTask`] enforces
//! retention.

pub mod claim;
pub mod cleanup;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod enqueue;
pub mod handler;
pub mod monitor;
pub mod recovery;
pub mod router;

pub use claim::ClaimService;
pub use cleanup::{CleanupStats, CleanupTask};
pub use config::{ConfigError, RelayConfig};
pub use dead_letter::{DeadLetter, DeadLetterSink, LogDeadLetterSink, PAYLOAD_PREVIEW_LEN};
pub use dispatcher::{Dispatcher, Kick, SweepStats};
pub use enqueue::{EnqueueError, EnqueueRequest, Enqueuer};
pub use handler::{HandlerRegistry, OutboxHandler};
pub use monitor::BacklogMonitor;
pub use recovery::RecoveryTask;
pub use router::{HashRouter, ShardRouter};
