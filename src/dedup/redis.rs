//! Redis-backed dedup store for shared dedup domains.
//!
//! Used when replicas of one dedup role must agree on first observation and
//! key-partitioned routing is not available. `SET NX PX` gives the same
//! set-if-absent-with-TTL contract the embedded store provides.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;
use xxhash_rust::xxh3::xxh3_128;

use crate::dedup::{DedupStore, Observation};
use crate::error::{PipelineError, Result};

/// Shared dedup store over a Redis instance.
pub struct RedisDedupStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisDedupStore {
    /// Connect to Redis. The prefix namespaces keys per pipeline so windows
    /// of different pipelines never collide.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PipelineError::DedupBackend(format!("bad redis url: {e}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| PipelineError::DedupBackend(format!("redis connect: {e}")))?;
        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    fn redis_key(&self, key: &[u8]) -> String {
        format!("{}:{:032x}", self.key_prefix, xxh3_128(key))
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn observe(&self, key: &[u8], ttl: Duration) -> Result<Observation> {
        let redis_key = self.redis_key(key);
        let ttl_ms = ttl.as_millis().max(1) as u64;

        // SET NX PX stores the key only when absent; the reply tells us
        // which side of the race we were on.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg("")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut self.connection.clone())
            .await
            .map_err(|e| PipelineError::DedupBackend(format!("redis SET NX: {e}")))?;

        Ok(match reply {
            Some(_) => Observation::FirstSeen,
            None => Observation::Duplicate,
        })
    }
}
