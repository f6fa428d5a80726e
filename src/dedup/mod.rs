//! Deduplication backends.
//!
//! A [`DedupStore`] answers one question atomically: has this key been seen
//! within its TTL window? The TTL is absolute, measured from the FIRST
//! observation; re-observing a key does NOT extend its lifetime. (Refreshing
//! on re-observation would let a steady trickle of duplicates suppress a key
//! forever.)

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryDedupStore;
pub use redis::RedisDedupStore;

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The key was not present; it is now recorded with the given TTL.
    FirstSeen,

    /// The key was recorded within its TTL window.
    Duplicate,
}

/// Set-if-absent store with per-key TTL.
///
/// Implementations must guarantee that two concurrent `observe` calls with
/// the same key return [`Observation::FirstSeen`] to at most one caller.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn observe(&self, key: &[u8], ttl: Duration) -> Result<Observation>;
}
