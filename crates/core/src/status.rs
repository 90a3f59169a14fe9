//! Outbox record lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an outbox record.
///
/// Transitions: `New -> Processing` (claim), `Processing -> Sent`
/// (delivered), `Processing -> Failed` (retryable error or lease expiry),
/// `Processing -> Dead` (retry budget exhausted), `Failed -> Processing`
/// (re-claim once the retry time elapses), `Dead -> New` (manual replay
/// only), and `Processing -> New` (lock released when no handler supports
/// the record's kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    New,
    Processing,
    Sent,
    Failed,
    Dead,
}

impl OutboxStatus {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OutboxStatus::New),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            "DEAD" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }

    /// Terminal states are never re-dispatched automatically. `Dead` is
    /// terminal-but-replayable via the operator surface.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }

    /// States eligible for the claim scan.
    pub fn is_claimable(&self) -> bool {
        matches!(self, OutboxStatus::New | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_wire_form() {
        for status in [
            OutboxStatus::New,
            OutboxStatus::Processing,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("RUNNING"), None);
    }

    #[test]
    fn terminal_and_claimable_are_disjoint() {
        assert!(OutboxStatus::Sent.is_terminal());
        assert!(OutboxStatus::Dead.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());

        assert!(OutboxStatus::New.is_claimable());
        assert!(OutboxStatus::Failed.is_claimable());
        assert!(!OutboxStatus::Processing.is_claimable());
        assert!(!OutboxStatus::Sent.is_claimable());
        assert!(!OutboxStatus::Dead.is_claimable());
    }
}
