//! The dispatcher: claims eligible records and drives them through their
//! handlers.
//!
//! Delivery is at-least-once. Terminal transitions go through
//! owner-guarded updates, so an instance that lost its lease mid-handler
//! cannot clobber the record's state; the duplicate side effect is the
//! handler's idempotency problem by contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use relaykit_core::{truncate_error, BackoffPolicy, InstanceId, OutboxRecord};
use relaykit_store::OutboxStore;

use crate::claim::ClaimService;
use crate::config::RelayConfig;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::handler::HandlerRegistry;

/// "Try this record now" hint emitted by the enqueuer after a commit.
/// Purely an optimization: a dropped kick just means the record waits
/// for the next polling sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kick {
    pub shard_id: i32,
    pub id: i64,
}

/// Per-sweep counters, logged after each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub dead: u64,
    pub released: u64,
}

pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    registry: HandlerRegistry,
    sink: Arc<dyn DeadLetterSink>,
    claims: ClaimService,
    policy: BackoffPolicy,
    config: RelayConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: HandlerRegistry,
        sink: Arc<dyn DeadLetterSink>,
        instance_id: InstanceId,
        config: RelayConfig,
    ) -> Self {
        let claims = ClaimService::new(instance_id, config.lease(), config.batch_size_per_shard);
        let policy = config.backoff_policy();
        Self {
            store,
            registry,
            sink,
            claims,
            policy,
            config,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.claims.instance_id()
    }

    /// One full pass over all shards at the given instant. Per-record
    /// and per-shard failures are logged and never abort the sweep.
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        for shard_id in 0..self.config.shard_count {
            let batch = match self
                .claims
                .claim_batch(self.store.as_ref(), &self.config.table, shard_id, now)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    error!(shard_id, error = %err, "claim failed, skipping shard");
                    continue;
                }
            };

            stats.claimed += batch.len() as u64;
            for record in batch {
                self.process(record, now, &mut stats).await;
            }
        }
        stats
    }

    /// Kick path: claim and process one specific record between sweeps.
    #[instrument(skip(self), fields(owner = %self.claims.owner()))]
    pub async fn dispatch_record(&self, shard_id: i32, id: i64, now: DateTime<Utc>) {
        let claimed = match self
            .claims
            .claim_one(self.store.as_ref(), &self.config.table, shard_id, id, now)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(shard_id, id, error = %err, "kick claim failed");
                return;
            }
        };

        match claimed {
            Some(record) => {
                let mut stats = SweepStats::default();
                self.process(record, now, &mut stats).await;
            }
            // Lost to a concurrent instance or already handled.
            None => debug!(shard_id, id, "kicked record not claimable"),
        }
    }

    async fn process(&self, record: OutboxRecord, now: DateTime<Utc>, stats: &mut SweepStats) {
        let table = &self.config.table;
        let owner = self.claims.owner();

        let Some(handler) = self.registry.find(&record.kind) else {
            warn!(
                id = record.id,
                kind = %record.kind,
                "no handler registered for kind, releasing lock"
            );
            match self.store.release_lock(table, record.id, owner, now).await {
                Ok(true) => stats.released += 1,
                Ok(false) => warn!(id = record.id, "lease lost before release"),
                Err(err) => error!(id = record.id, error = %err, "release failed"),
            }
            return;
        };

        match handler.handle(&record).await {
            Ok(()) => {
                match self.store.mark_sent(table, record.id, owner, now).await {
                    Ok(true) => {
                        debug!(id = record.id, kind = %record.kind, "record sent");
                        stats.sent += 1;
                    }
                    // The handler side effect happened but the lease was
                    // lost; the record will be delivered again. This is
                    // the at-least-once window.
                    Ok(false) => warn!(id = record.id, "lease lost before mark_sent"),
                    Err(err) => error!(id = record.id, error = %err, "mark_sent failed"),
                }
            }
            Err(handler_err) => {
                let message = truncate_error(&format!("{handler_err:#}"));
                let retry_count = record.retry_count + 1;

                if self.policy.is_exhausted(retry_count) {
                    match self
                        .store
                        .mark_dead(table, record.id, owner, &message, now)
                        .await
                    {
                        Ok(true) => {
                            stats.dead += 1;
                            let mut snapshot = record;
                            snapshot.retry_count = retry_count;
                            self.sink
                                .notify(&DeadLetter::from_record(&snapshot, handler.name(), &message));
                        }
                        Ok(false) => warn!(id = record.id, "lease lost before mark_dead"),
                        Err(err) => error!(id = record.id, error = %err, "mark_dead failed"),
                    }
                } else {
                    let next_retry = now + self.policy.delay_for(retry_count);
                    match self
                        .store
                        .mark_failed(table, record.id, owner, retry_count, next_retry, &message, now)
                        .await
                    {
                        Ok(true) => {
                            debug!(
                                id = record.id,
                                retry_count,
                                next_retry = %next_retry,
                                "record scheduled for retry"
                            );
                            stats.retried += 1;
                        }
                        Ok(false) => warn!(id = record.id, "lease lost before mark_failed"),
                        Err(err) => error!(id = record.id, error = %err, "mark_failed failed"),
                    }
                }
            }
        }
    }

    /// Main loop: polling sweep on `sweep_interval_ms` plus immediate
    /// dispatch of kick hints, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut kick_rx: mpsc::Receiver<Kick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut kicks_open = true;

        info!(
            instance_id = %self.instance_id(),
            table = %self.config.table,
            shard_count = self.config.shard_count,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let stats = self.sweep_once_at(Utc::now()).await;
                    if stats.claimed > 0 {
                        info!(?stats, "sweep complete");
                    }
                }
                kick = kick_rx.recv(), if kicks_open => match kick {
                    Some(kick) => self.dispatch_record(kick.shard_id, kick.id, Utc::now()).await,
                    None => kicks_open = false,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!(instance_id = %self.instance_id(), "dispatcher stopped");
    }
}
