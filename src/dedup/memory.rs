//! Embedded TTL key-value store for single-process deduplication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_128;

use crate::dedup::{DedupStore, Observation};
use crate::error::Result;

/// How many observations between opportunistic sweeps of expired entries.
const SWEEP_INTERVAL: u64 = 4096;

/// In-process dedup store.
///
/// Keys are folded to their 128-bit xxh3 hash; only the expiry instant is
/// stored, so memory per live key is constant. Expired entries are replaced
/// lazily on re-observation and swept opportunistically every
/// [`SWEEP_INTERVAL`] observations.
pub struct MemoryDedupStore {
    entries: DashMap<u128, Instant>,
    observations: AtomicU64,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            observations: AtomicU64::new(0),
        }
    }

    /// Number of live (possibly expired but unswept) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self, now: Instant) {
        self.entries.retain(|_, expires| *expires > now);
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn observe(&self, key: &[u8], ttl: Duration) -> Result<Observation> {
        let hash = xxh3_128(key);
        let now = Instant::now();

        let count = self.observations.fetch_add(1, Ordering::Relaxed);
        if count % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        // The entry API holds the shard lock across the check-and-set, which
        // is what makes concurrent observations of one key race-free.
        let observation = match self.entries.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    Observation::Duplicate
                } else {
                    occupied.insert(now + ttl);
                    Observation::FirstSeen
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                Observation::FirstSeen
            }
        };

        Ok(observation)
    }
}
