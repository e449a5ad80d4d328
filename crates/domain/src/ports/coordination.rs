use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store serialization error: {0}")]
    Serialization(String),
    #[error("coordination store operation failed: {0}")]
    Operation(String),
}

/// Shared key-value store used for locks, ownership markers, cached
/// artifacts and debounce buffers. Lock TTLs are applied with millisecond
/// precision; `set` takes second-granularity TTLs for cached values.
pub trait CoordinationStore: Send + Sync {
    /// `SET key value NX PX ttl`. Returns `true` when the key was claimed.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>>;

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinationError>>;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<(), CoordinationError>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinationError>>;

    /// Atomic compare-and-delete.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>>;

    /// Atomic compare-and-expire; refreshes the TTL only while `expected` is
    /// still the stored value.
    fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>>;

    /// Appends to the tail of a list and returns the new length.
    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, CoordinationError>>;

    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>>;

    fn list_len(&self, key: &str) -> BoxFuture<'_, Result<u64, CoordinationError>>;

    /// Drops the first `count` items and returns how many remain.
    fn list_trim_front(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFuture<'_, Result<u64, CoordinationError>>;

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>>;
}

pub fn ttl_ms(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 { 1 } else { ms }
}

pub fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
