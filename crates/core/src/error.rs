//! Domain-level validation errors.

use thiserror::Error;

/// Deterministic input/configuration failures surfaced synchronously to
/// the caller. Storage and delivery failures belong to other layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An empty sharding key makes a record unroutable; rejected rather
    /// than silently defaulted.
    #[error("sharding key must not be empty")]
    EmptyShardingKey,

    /// Table names are interpolated into SQL and restricted accordingly.
    #[error("invalid table name '{0}': only [A-Za-z0-9_] is allowed")]
    InvalidTableName(String),

    /// An explicit shard id outside the configured shard range.
    #[error("shard id {shard_id} out of range 0..{shard_count}")]
    ShardOutOfRange { shard_id: i32, shard_count: u32 },
}

/// Validate a dynamic outbox table name (e.g. `order_outbox`).
pub fn validate_table_name(table: &str) -> Result<(), ValidationError> {
    if table.is_empty() || !table.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(ValidationError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_table_names() {
        assert!(validate_table_name("outbox").is_ok());
        assert!(validate_table_name("order_outbox_2").is_ok());
    }

    #[test]
    fn rejects_sql_metacharacters() {
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("outbox; drop table t").is_err());
        assert!(validate_table_name("out-box").is_err());
        assert!(validate_table_name("outbox\"").is_err());
    }
}
