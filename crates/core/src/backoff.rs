//! Retry backoff policy.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a hard cap, plus the retry budget that
/// promotes a record to the dead-letter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Failures allowed before a record goes `Dead`.
    pub max_retry_count: i32,
    /// Ceiling on the retry delay, in seconds.
    pub cap_seconds: i64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 20,
            cap_seconds: 300,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retry_count: i32, cap_seconds: i64) -> Self {
        Self {
            max_retry_count,
            cap_seconds,
        }
    }

    /// Delay before the given attempt: `min(2^retry_count, cap)` seconds.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let seconds = if retry_count < 0 {
            0
        } else if retry_count >= 63 {
            self.cap_seconds
        } else {
            (1i64 << retry_count).min(self.cap_seconds)
        };
        Duration::seconds(seconds)
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(2));
        assert_eq!(policy.delay_for(2), Duration::seconds(4));
        assert_eq!(policy.delay_for(8), Duration::seconds(256));
        assert_eq!(policy.delay_for(9), Duration::seconds(300));
        assert_eq!(policy.delay_for(20), Duration::seconds(300));
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(63), Duration::seconds(300));
        assert_eq!(policy.delay_for(i32::MAX), Duration::seconds(300));
    }

    #[test]
    fn budget_exhaustion() {
        let policy = BackoffPolicy::new(2, 300);
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: delays are monotonically non-decreasing in the
            /// retry count and never exceed the cap.
            #[test]
            fn monotone_and_capped(retry_count in 0i32..200, cap in 1i64..3600) {
                let policy = BackoffPolicy::new(20, cap);
                let current = policy.delay_for(retry_count);
                let next = policy.delay_for(retry_count + 1);

                prop_assert!(next >= current);
                prop_assert!(current <= Duration::seconds(cap));
                prop_assert!(current >= Duration::seconds(0));
            }
        }
    }
}
