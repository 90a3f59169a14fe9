//! Handler dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use relaykit_core::OutboxRecord;

/// A delivery handler for one or more record kinds.
///
/// Handlers MUST be idempotent: the relay guarantees at-least-once
/// dispatch, so a handler can see the same record again after a crash or
/// an expired lease even when the previous attempt side-effected.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// Stable name for logs and dead-letter notifications.
    fn name(&self) -> &str;

    /// Whether this handler delivers records of the given kind.
    fn supports(&self, kind: &str) -> bool;

    /// Deliver one record. `Ok` marks it `Sent`; `Err` schedules a retry
    /// (or dead-letters once the retry budget is spent).
    async fn handle(&self, record: &OutboxRecord) -> anyhow::Result<()>;
}

/// Ordered handler registry; the first handler whose `supports` matches
/// wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) {
        self.handlers.push(handler);
    }

    pub fn with(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn find(&self, kind: &str) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.iter().find(|h| h.supports(kind)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKindHandler {
        name: &'static str,
        kind: &'static str,
    }

    #[async_trait]
    impl OutboxHandler for FixedKindHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, kind: &str) -> bool {
            kind == self.kind
        }

        async fn handle(&self, _record: &OutboxRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_matching_handler_wins() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(FixedKindHandler {
                name: "email-a",
                kind: "SEND_EMAIL",
            }))
            .with(Arc::new(FixedKindHandler {
                name: "email-b",
                kind: "SEND_EMAIL",
            }));

        let found = registry.find("SEND_EMAIL").unwrap();
        assert_eq!(found.name(), "email-a");
        assert!(registry.find("UNKNOWN_KIND").is_none());
    }
}
