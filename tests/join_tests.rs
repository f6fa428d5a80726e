//! Temporal join scenario tests.

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;

use streamforge::models::{JoinOrientation, JoinSourceSpec, JoinSpec, JoinType};
use streamforge::pipeline::TemporalJoiner;

fn join_spec(left_ttl_ms: u64, right_ttl_ms: u64) -> JoinSpec {
    JoinSpec {
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
    }
}

/// Symmetric-TTL scenario: L arrives, R joins inside the window, a second R
/// after the left buffer expired produces nothing.
#[test]
fn test_symmetric_ttl_scenario() {
    // Scaled down from seconds to milliseconds: TTL 60ms, R at ~35ms and
    // ~75ms after L.
    let joiner = TemporalJoiner::from_spec(&join_spec(60, 60)).unwrap();
    let key = b"9".to_vec();

    let none = joiner.push(
        JoinOrientation::Left,
        key.clone(),
        json!({"uid": 9, "amt": 10}),
        Utc::now(),
        1,
    );
    assert!(none.is_none());

    std::thread::sleep(std::time::Duration::from_millis(35));
    let emission = joiner
        .push(
            JoinOrientation::Right,
            key.clone(),
            json!({"uid": 9, "geo": "EU"}),
            Utc::now(),
            2,
        )
        .expect("R inside the window joins");
    assert_eq!(
        emission.record,
        json!({
            "left": {"uid": 9, "amt": 10},
            "right": {"uid": 9, "geo": "EU"},
        })
    );

    std::thread::sleep(std::time::Duration::from_millis(40));
    let none = joiner.push(
        JoinOrientation::Right,
        key,
        json!({"uid": 9, "geo": "US"}),
        Utc::now(),
        3,
    );
    assert!(none.is_none(), "left buffer expired, no second emission");
}

/// Join TTL bound: arrivals of every emitted pair are within the larger of
/// the two side TTLs.
#[test]
fn test_join_ttl_bound() {
    let left_ttl = 50u64;
    let right_ttl = 120u64;
    let joiner = TemporalJoiner::from_spec(&join_spec(left_ttl, right_ttl)).unwrap();
    let max_ttl = chrono::Duration::milliseconds(right_ttl as i64);

    let mut emissions = Vec::new();
    for i in 0..4usize {
        std::thread::sleep(std::time::Duration::from_millis(30));
        let side = if i % 2 == 0 {
            JoinOrientation::Left
        } else {
            JoinOrientation::Right
        };
        if let Some(emission) = joiner.push(
            side,
            b"k".to_vec(),
            json!({"uid": "k", "i": i}),
            Utc::now(),
            i as u64,
        ) {
            emissions.push(emission);
        }
    }

    assert!(!emissions.is_empty());
    for emission in emissions {
        let spread = (emission.right_arrival - emission.left_arrival)
            .abs()
            .to_std()
            .unwrap();
        assert!(spread <= max_ttl.to_std().unwrap(), "spread {spread:?}");
    }
}

/// Concurrent pushes from two reader threads never lose emissions and never
/// emit twice for the same (left, right) pair.
#[test]
fn test_two_threads_one_emission_per_pair() {
    use std::collections::HashSet;
    use std::sync::Arc;

    let joiner = Arc::new(TemporalJoiner::from_spec(&join_spec(5000, 5000)).unwrap());
    let keys = 64u64;

    let spawn_side = |side: JoinOrientation, joiner: Arc<TemporalJoiner>| {
        std::thread::spawn(move || {
            let mut emissions = Vec::new();
            for uid in 0..keys {
                let record = json!({"uid": uid, "side": side.as_str()});
                if let Some(emission) =
                    joiner.push(side, uid.to_string().into_bytes(), record, Utc::now(), uid)
                {
                    emissions.push(emission);
                }
            }
            emissions
        })
    };

    let left = spawn_side(JoinOrientation::Left, joiner.clone());
    let right = spawn_side(JoinOrientation::Right, joiner);

    let mut all = left.join().unwrap();
    all.extend(right.join().unwrap());

    // Every key joins exactly once: whichever side arrives second emits.
    assert_eq!(all.len(), keys as usize);
    let pairs: HashSet<String> = all.iter().map(|e| e.publish_id()).collect();
    assert_eq!(pairs.len(), keys as usize);
}
