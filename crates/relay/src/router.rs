//! Shard routing for enqueued records.

use relaykit_core::ValidationError;

/// Maps a sharding key to a physical shard id. The shard id is computed
/// once at enqueue time, persisted on the record, and never recomputed;
/// changing the routing function only affects new records.
pub trait ShardRouter: Send + Sync {
    fn shard_count(&self) -> i32;

    /// Shard for the given key; must return a value in
    /// `0..shard_count()`.
    fn shard_for(&self, sharding_key: &str) -> i32;
}

/// Default router: FNV-1a hash of the key modulo the shard count. Stable
/// across processes and restarts, which keeps records for one key on one
/// shard.
#[derive(Debug, Clone, Copy)]
pub struct HashRouter {
    shard_count: i32,
}

impl HashRouter {
    pub fn new(shard_count: i32) -> Result<Self, ValidationError> {
        if shard_count < 1 {
            return Err(ValidationError::ShardOutOfRange {
                shard_id: shard_count,
                shard_count: shard_count.max(0) as u32,
            });
        }
        Ok(Self { shard_count })
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl ShardRouter for HashRouter {
    fn shard_count(&self) -> i32 {
        self.shard_count
    }

    fn shard_for(&self, sharding_key: &str) -> i32 {
        (fnv1a(sharding_key.as_bytes()) % self.shard_count as u64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_and_in_range() {
        let router = HashRouter::new(3).unwrap();
        for key in ["order-1", "order-2", "", "a-very-long-sharding-key"] {
            let shard = router.shard_for(key);
            assert!((0..3).contains(&shard), "shard {shard} for key {key:?}");
            assert_eq!(shard, router.shard_for(key));
        }
    }

    #[test]
    fn single_shard_routes_everything_to_zero() {
        let router = HashRouter::new(1).unwrap();
        assert_eq!(router.shard_for("anything"), 0);
    }

    #[test]
    fn rejects_non_positive_counts() {
        assert!(HashRouter::new(0).is_err());
        assert!(HashRouter::new(-3).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn always_in_range(key in ".*", shard_count in 1i32..64) {
                let router = HashRouter::new(shard_count).unwrap();
                let shard = router.shard_for(&key);
                prop_assert!((0..shard_count).contains(&shard));
            }
        }
    }
}
