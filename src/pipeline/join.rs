//! Two-stream temporal equi-join.
//!
//! Each side buffers its records by join key with a per-side TTL. An
//! incoming record first probes the opposite buffer: a live entry produces a
//! joined emission, and the probed entry is RETAINED (first-match-wins per
//! side: later arrivals on the probing side may join against it again until
//! it expires). The record is then inserted into its own side's buffer,
//! replacing any previous record with the same key.
//!
//! Expired entries are removed lazily on lookup and by an opportunistic
//! purge; a joined record is never emitted from an expired entry. Both
//! buffers live behind one mutex, so the two reader tasks (one per side)
//! can never interleave buffer mutations. Simultaneous arrivals for the
//! same key serialize on the lock in whatever order they acquire it; the
//! emitted record is the same either way, because its left/right
//! orientation comes from each record's side, never from which push ran
//! first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::models::{JoinOrientation, JoinSpec};
use crate::pipeline::path::JsonPath;

/// How many pushes between opportunistic purges of expired entries.
const PURGE_INTERVAL: u64 = 1024;

/// One buffered record.
#[derive(Debug, Clone)]
struct BufferedEntry {
    record: Value,
    arrival_ts: DateTime<Utc>,
    sequence: u64,
    expires: Instant,
}

#[derive(Default)]
struct Buffers {
    left: HashMap<Vec<u8>, BufferedEntry>,
    right: HashMap<Vec<u8>, BufferedEntry>,
    pushes: u64,
}

impl Buffers {
    fn side_mut(&mut self, side: JoinOrientation) -> &mut HashMap<Vec<u8>, BufferedEntry> {
        match side {
            JoinOrientation::Left => &mut self.left,
            JoinOrientation::Right => &mut self.right,
        }
    }
}

/// A joined record ready for publication.
///
/// The input stream sequences identify the exact pair of records that
/// produced the emission; their hash is the idempotent publish id, so a
/// redelivered input that re-joins the same pair collapses on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEmission {
    pub record: Value,
    pub left_arrival: DateTime<Utc>,
    pub right_arrival: DateTime<Utc>,
    pub left_sequence: u64,
    pub right_sequence: u64,
}

impl JoinEmission {
    /// Idempotency id derived from the input offsets.
    pub fn publish_id(&self) -> String {
        format!("join:{}:{}", self.left_sequence, self.right_sequence)
    }
}

/// Snapshot of the joiner's counters.
#[derive(Debug, Clone, Default)]
pub struct JoinerStats {
    pub emitted: u64,
    pub expired_removed: u64,
    pub buffered_left: usize,
    pub buffered_right: usize,
}

#[derive(Default)]
struct JoinCounters {
    emitted: AtomicU64,
    expired_removed: AtomicU64,
}

/// In-process state of the temporal join.
pub struct TemporalJoiner {
    left_key: JsonPath,
    right_key: JsonPath,
    left_ttl: Duration,
    right_ttl: Duration,
    buffers: Mutex<Buffers>,
    counters: JoinCounters,
}

impl TemporalJoiner {
    /// Build from a validated join spec.
    pub fn from_spec(spec: &JoinSpec) -> Result<Self> {
        let left = spec.source(JoinOrientation::Left).ok_or_else(|| {
            crate::error::PipelineError::ConfigInvalid("join is missing its left source".into())
        })?;
        let right = spec.source(JoinOrientation::Right).ok_or_else(|| {
            crate::error::PipelineError::ConfigInvalid("join is missing its right source".into())
        })?;

        Ok(Self {
            left_key: JsonPath::compile(&left.key_path)?,
            right_key: JsonPath::compile(&right.key_path)?,
            left_ttl: left.buffer_ttl(),
            right_ttl: right.buffer_ttl(),
            buffers: Mutex::new(Buffers::default()),
            counters: JoinCounters::default(),
        })
    }

    /// Key path for one side; extraction is identical to filter/transform.
    pub fn key_path(&self, side: JoinOrientation) -> &JsonPath {
        match side {
            JoinOrientation::Left => &self.left_key,
            JoinOrientation::Right => &self.right_key,
        }
    }

    fn ttl(&self, side: JoinOrientation) -> Duration {
        match side {
            JoinOrientation::Left => self.left_ttl,
            JoinOrientation::Right => self.right_ttl,
        }
    }

    /// Push one record on the given side; returns the joined emission when
    /// the opposite buffer holds a live entry for the key. `sequence` is the
    /// record's input stream sequence, carried through for idempotent
    /// publication.
    pub fn push(
        &self,
        side: JoinOrientation,
        key: Vec<u8>,
        record: Value,
        arrival_ts: DateTime<Utc>,
        sequence: u64,
    ) -> Option<JoinEmission> {
        let now = Instant::now();
        let mut buffers = self.buffers.lock();

        buffers.pushes += 1;
        if buffers.pushes % PURGE_INTERVAL == 0 {
            let removed = purge(&mut buffers, now);
            self.counters.expired_removed.fetch_add(removed, Ordering::Relaxed);
        }

        // Probe the opposite side first; an expired entry is removed, never
        // joined against.
        let other = buffers.side_mut(side.opposite());
        let emission = match other.get(&key) {
            Some(entry) if entry.expires > now => {
                // The probing side supplies one half, the buffered entry the
                // other; orient them into the stable output shape.
                let (left, right) = match side {
                    JoinOrientation::Left => (
                        (record.clone(), arrival_ts, sequence),
                        (entry.record.clone(), entry.arrival_ts, entry.sequence),
                    ),
                    JoinOrientation::Right => (
                        (entry.record.clone(), entry.arrival_ts, entry.sequence),
                        (record.clone(), arrival_ts, sequence),
                    ),
                };
                Some(JoinEmission {
                    record: json!({
                        "left": left.0,
                        "right": right.0,
                    }),
                    left_arrival: left.1,
                    right_arrival: right.1,
                    left_sequence: left.2,
                    right_sequence: right.2,
                })
            }
            Some(_) => {
                other.remove(&key);
                self.counters.expired_removed.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };

        if emission.is_some() {
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        }

        // Always buffer the incoming record on its own side, replacing any
        // previous record with the same key.
        let ttl = self.ttl(side);
        buffers.side_mut(side).insert(
            key,
            BufferedEntry {
                record,
                arrival_ts,
                sequence,
                expires: now + ttl,
            },
        );

        emission
    }

    /// Drop every expired entry now. The role loop calls this between
    /// batches; correctness only requires the lazy removal in [`push`].
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let removed = purge(&mut self.buffers.lock(), now);
        self.counters.expired_removed.fetch_add(removed, Ordering::Relaxed);
    }

    /// Live entries per side, for internal observability.
    pub fn buffered(&self) -> (usize, usize) {
        let buffers = self.buffers.lock();
        (buffers.left.len(), buffers.right.len())
    }

    pub fn stats(&self) -> JoinerStats {
        let (buffered_left, buffered_right) = self.buffered();
        JoinerStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            expired_removed: self.counters.expired_removed.load(Ordering::Relaxed),
            buffered_left,
            buffered_right,
        }
    }

    /// Background sweeper bounding buffer memory when one side goes quiet.
    /// Optional: joins stay correct on lazy removal alone.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let joiner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                joiner.purge_expired();
                let stats = joiner.stats();
                debug!(
                    buffered_left = stats.buffered_left,
                    buffered_right = stats.buffered_right,
                    expired_removed = stats.expired_removed,
                    "join buffers swept"
                );
            }
        })
    }
}

fn purge(buffers: &mut Buffers, now: Instant) -> u64 {
    let before = buffers.left.len() + buffers.right.len();
    buffers.left.retain(|_, entry| entry.expires > now);
    buffers.right.retain(|_, entry| entry.expires > now);
    (before - buffers.left.len() - buffers.right.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JoinSourceSpec, JoinType};
    use serde_json::json;

    fn joiner(left_ttl_ms: u64, right_ttl_ms: u64) -> TemporalJoiner {
        TemporalJoiner::from_spec(&JoinSpec {
            enabled: true,
            join_type: JoinType::Temporal,
            output_stream_id: "p1.join".to_string(),
            sources: vec![
                JoinSourceSpec {
                    stream_id: "p1.dedup.l".to_string(),
                    orientation: JoinOrientation::Left,
                    key_path: "uid".to_string(),
                    buffer_ttl_ms: left_ttl_ms,
                },
                JoinSourceSpec {
                    stream_id: "p1.dedup.r".to_string(),
                    orientation: JoinOrientation::Right,
                    key_path: "uid".to_string(),
                    buffer_ttl_ms: right_ttl_ms,
                },
            ],
        })
        .unwrap()
    }

    fn key(uid: u64) -> Vec<u8> {
        uid.to_string().into_bytes()
    }

    #[test]
    fn test_match_emits_oriented_record() {
        let joiner = joiner(5000, 5000);

        let none = joiner.push(
            JoinOrientation::Left,
            key(9),
            json!({"uid": 9, "amt": 10}),
            Utc::now(),
            1,
        );
        assert!(none.is_none());

        let emission = joiner
            .push(
                JoinOrientation::Right,
                key(9),
                json!({"uid": 9, "geo": "EU"}),
                Utc::now(),
                2,
            )
            .expect("matching key should join");

        assert_eq!(
            emission.record,
            json!({
                "left": {"uid": 9, "amt": 10},
                "right": {"uid": 9, "geo": "EU"},
            })
        );
        assert!(emission.left_arrival <= emission.right_arrival);
        assert_eq!(emission.publish_id(), "join:1:2");
    }

    #[test]
    fn test_different_keys_do_not_join() {
        let joiner = joiner(5000, 5000);
        joiner.push(JoinOrientation::Left, key(1), json!({"uid": 1}), Utc::now(), 1);
        let none = joiner.push(JoinOrientation::Right, key(2), json!({"uid": 2}), Utc::now(), 2);
        assert!(none.is_none());
    }

    #[test]
    fn test_first_match_retains_other_side_entry() {
        let joiner = joiner(5000, 5000);
        joiner.push(
            JoinOrientation::Right,
            key(7),
            json!({"uid": 7, "geo": "EU"}),
            Utc::now(),
            1,
        );

        // Two left arrivals both join against the retained right entry.
        for amt in [10u64, 20] {
            let emission = joiner
                .push(
                    JoinOrientation::Left,
                    key(7),
                    json!({"uid": 7, "amt": amt}),
                    Utc::now(),
                    amt,
                )
                .expect("retained entry should join again");
            assert_eq!(emission.record["left"]["amt"], json!(amt));
            assert_eq!(emission.record["right"]["geo"], json!("EU"));
        }
    }

    #[test]
    fn test_same_side_insert_replaces_previous_record() {
        let joiner = joiner(5000, 5000);
        joiner.push(JoinOrientation::Left, key(3), json!({"uid": 3, "v": "old"}), Utc::now(), 1);
        joiner.push(JoinOrientation::Left, key(3), json!({"uid": 3, "v": "new"}), Utc::now(), 2);

        let emission = joiner
            .push(JoinOrientation::Right, key(3), json!({"uid": 3}), Utc::now(), 3)
            .unwrap();
        assert_eq!(emission.record["left"]["v"], json!("new"));
        assert_eq!(emission.left_sequence, 2);
    }

    #[test]
    fn test_expired_entry_never_joins() {
        let joiner = joiner(30, 5000);
        joiner.push(JoinOrientation::Left, key(9), json!({"uid": 9, "amt": 10}), Utc::now(), 1);

        std::thread::sleep(Duration::from_millis(60));

        // The left buffer entry for uid=9 has expired; no emission.
        let none = joiner.push(
            JoinOrientation::Right,
            key(9),
            json!({"uid": 9, "geo": "US"}),
            Utc::now(),
            2,
        );
        assert!(none.is_none());

        // The right record was still buffered, so a fresh left arrival joins.
        let emission = joiner
            .push(
                JoinOrientation::Left,
                key(9),
                json!({"uid": 9, "amt": 11}),
                Utc::now(),
                3,
            )
            .unwrap();
        assert_eq!(emission.record["right"]["geo"], json!("US"));
    }

    #[test]
    fn test_purge_drops_expired_entries() {
        let joiner = joiner(10, 10);
        joiner.push(JoinOrientation::Left, key(1), json!({"uid": 1}), Utc::now(), 1);
        joiner.push(JoinOrientation::Right, key(2), json!({"uid": 2}), Utc::now(), 2);
        assert_eq!(joiner.buffered(), (1, 1));

        std::thread::sleep(Duration::from_millis(30));
        joiner.purge_expired();
        assert_eq!(joiner.buffered(), (0, 0));
        assert_eq!(joiner.stats().expired_removed, 2);
    }

    #[test]
    fn test_stats_count_emissions() {
        let joiner = joiner(5000, 5000);
        joiner.push(JoinOrientation::Left, key(1), json!({"uid": 1}), Utc::now(), 1);
        joiner.push(JoinOrientation::Right, key(1), json!({"uid": 1}), Utc::now(), 2);
        joiner.push(JoinOrientation::Left, key(2), json!({"uid": 2}), Utc::now(), 3);

        let stats = joiner.stats();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.buffered_left, 2);
        assert_eq!(stats.buffered_right, 1);
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let joiner = Arc::new(joiner(10, 10));
        joiner.push(JoinOrientation::Left, key(1), json!({"uid": 1}), Utc::now(), 1);

        let cancel = CancellationToken::new();
        let handle = joiner.spawn_sweeper(Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(joiner.buffered(), (0, 0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_asymmetric_ttls() {
        let joiner = joiner(20, 5000);

        joiner.push(
            JoinOrientation::Right,
            key(5),
            json!({"uid": 5, "geo": "EU"}),
            Utc::now(),
            1,
        );
        std::thread::sleep(Duration::from_millis(50));

        // Right TTL is long; left arrival still joins.
        assert!(joiner
            .push(JoinOrientation::Left, key(5), json!({"uid": 5, "amt": 1}), Utc::now(), 2)
            .is_some());

        // Left entries expire quickly; a right arrival after the left TTL
        // cannot join against it.
        std::thread::sleep(Duration::from_millis(50));
        assert!(joiner
            .push(JoinOrientation::Right, key(5), json!({"uid": 5, "geo": "US"}), Utc::now(), 3)
            .is_none());
    }
}
