//! End-to-end processing tests against in-memory substitutes.
//!
//! These drive records through the dedup role's processor chain and the
//! sink's schema mapping into an in-memory columnar sink, covering the
//! pass-through, dedup-window, and poison-record paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use streamforge::dedup::{DedupStore, MemoryDedupStore, Observation};
use streamforge::error::{ErrorKind, PipelineError, Result};
use streamforge::models::{
    BatchSpec, ColumnMapping, DeadLetter, DedupSpec, FieldMapping, FilterSpec, PipelineSpec,
    SinkConnection, SinkSpec, SourceSpec, TargetType, TopicSpec, TransformSpec,
};
use streamforge::pipeline::chain::DeadLetterSink;
use streamforge::pipeline::{ChainOutput, ProcessorChain};
use streamforge::sink::{ColumnarSink, SchemaMapping};

/// Dead-letter sink capturing letters in memory.
#[derive(Default)]
struct RecordingDlq {
    letters: Mutex<Vec<DeadLetter>>,
}

#[async_trait]
impl DeadLetterSink for RecordingDlq {
    async fn write(&self, letter: &DeadLetter) -> Result<()> {
        self.letters.lock().push(letter.clone());
        Ok(())
    }
}

/// Columnar sink collecting rows in memory; one insert is one atomic batch.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<Vec<Map<String, Value>>>,
}

#[async_trait]
impl ColumnarSink for MemorySink {
    async fn insert(&self, rows: &[Map<String, Value>]) -> Result<()> {
        self.rows.lock().extend(rows.iter().cloned());
        Ok(())
    }
}

fn sink_spec() -> SinkSpec {
    SinkSpec {
        sink_type: "clickhouse".to_string(),
        stream_id: "p1.dedup.t1".to_string(),
        batch: BatchSpec {
            max_size: 500,
            max_delay_ms: 100,
        },
        column_mapping: vec![
            ColumnMapping {
                source_path: "id".to_string(),
                column: "id".to_string(),
                column_type: TargetType::Int,
            },
            ColumnMapping {
                source_path: "v".to_string(),
                column: "v".to_string(),
                column_type: TargetType::String,
            },
        ],
        connection: SinkConnection {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            table: "tbl".to_string(),
            username: None,
            password: None,
        },
    }
}

fn pipeline(dedup_window_ms: Option<u64>, transform: Option<TransformSpec>) -> PipelineSpec {
    PipelineSpec {
        id: "p1".to_string(),
        name: "P1".to_string(),
        source: SourceSpec {
            topics: vec![TopicSpec {
                name: "t1".to_string(),
                output_stream_id: "p1.dedup.t1".to_string(),
                replicas: 1,
                deduplication: dedup_window_ms.map(|window_ms| DedupSpec {
                    enabled: true,
                    key_path: "id".to_string(),
                    window_ms,
                }),
            }],
        },
        filter: FilterSpec::default(),
        stateless_transform: transform.unwrap_or_default(),
        join: None,
        sink: sink_spec(),
        status: Default::default(),
    }
}

struct Harness {
    chain: ProcessorChain,
    mapping: SchemaMapping,
    sink: Arc<MemorySink>,
    dlq: Arc<RecordingDlq>,
}

impl Harness {
    fn new(spec: &PipelineSpec) -> Self {
        Self::with_store(spec, Arc::new(MemoryDedupStore::new()))
    }

    fn with_store(spec: &PipelineSpec, store: Arc<dyn DedupStore>) -> Self {
        spec.validate().unwrap();
        let dlq = Arc::new(RecordingDlq::default());
        let chain = ProcessorChain::for_dedup_role(
            spec,
            &spec.source.topics[0],
            "p1.in.t1",
            store,
            dlq.clone(),
        )
        .unwrap();
        Self {
            chain,
            mapping: SchemaMapping::compile(&spec.sink.column_mapping).unwrap(),
            sink: Arc::new(MemorySink::default()),
            dlq,
        }
    }

    /// Push one record through chain, mapping and sink, the way the dedup
    /// and sink roles do across the bus.
    async fn feed(&self, record: Value) -> Result<ChainOutput> {
        let original = serde_json::to_vec(&record).unwrap();
        let output = self.chain.run(&original, record).await?;

        if let ChainOutput::Emit(processed) = &output {
            match self.mapping.map_record(processed) {
                Ok(row) => self.sink.insert(&[row]).await?,
                Err(e) => {
                    self.dlq
                        .write(&DeadLetter::new(
                            "p1",
                            "sink",
                            ErrorKind::PoisonRecord,
                            e.to_string(),
                            &original,
                            "p1.dedup.t1",
                        ))
                        .await?;
                }
            }
        }

        Ok(output)
    }

    fn rows(&self) -> Vec<Map<String, Value>> {
        self.sink.rows.lock().clone()
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dlq.letters.lock().clone()
    }
}

/// Single topic, no dedup/filter/transform: records land in the table in
/// arrival order and nothing is dead-lettered.
#[tokio::test]
async fn test_single_topic_pass_through() {
    let spec = pipeline(None, None);
    let harness = Harness::new(&spec);

    for id in 1..=3 {
        let output = harness.feed(json!({"id": id, "v": "x"})).await.unwrap();
        assert!(matches!(output, ChainOutput::Emit(_)));
    }

    let ids: Vec<i64> = harness
        .rows()
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(harness.dead_letters().is_empty());
}

/// Dedup window: the duplicate inside the window is dropped, the
/// re-observation after expiry passes.
#[tokio::test]
async fn test_dedup_window_end_to_end() {
    let spec = pipeline(Some(80), None);
    let harness = Harness::new(&spec);

    harness.feed(json!({"id": 1, "v": "a"})).await.unwrap();
    let dropped = harness.feed(json!({"id": 1, "v": "b"})).await.unwrap();
    assert_eq!(dropped, ChainOutput::Drop);

    tokio::time::sleep(Duration::from_millis(120)).await;
    harness.feed(json!({"id": 1, "v": "c"})).await.unwrap();

    let rows = harness.rows();
    let values: Vec<&str> = rows
        .iter()
        .map(|row| row["v"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["a", "c"]);
    assert!(harness.dead_letters().is_empty());
}

/// A record failing type coercion produces no row and exactly one dead
/// letter whose `original` decodes back to the input.
#[tokio::test]
async fn test_poison_record_routes_to_dlq() {
    let transform = TransformSpec {
        enabled: true,
        mappings: vec![
            FieldMapping {
                source_path: "id".to_string(),
                target_field: "id".to_string(),
                target_type: TargetType::Int,
            },
            FieldMapping {
                source_path: "amt".to_string(),
                target_field: "v".to_string(),
                target_type: TargetType::Int,
            },
        ],
        passthrough: false,
    };
    let spec = pipeline(None, Some(transform));
    let harness = Harness::new(&spec);

    let record = json!({"id": 1, "amt": "oops"});
    let output = harness.feed(record.clone()).await.unwrap();
    assert_eq!(output, ChainOutput::DeadLettered);

    assert!(harness.rows().is_empty());

    let letters = harness.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error.kind, ErrorKind::PoisonRecord);
    let original: Value = serde_json::from_slice(&letters[0].original_bytes().unwrap()).unwrap();
    assert_eq!(original, record);
}

/// Filter + dedup + transform composed in declared order.
#[tokio::test]
async fn test_full_chain_composition() {
    let mut spec = pipeline(
        Some(60_000),
        Some(TransformSpec {
            enabled: true,
            mappings: vec![
                FieldMapping {
                    source_path: "id".to_string(),
                    target_field: "id".to_string(),
                    target_type: TargetType::Int,
                },
                FieldMapping {
                    source_path: "v".to_string(),
                    target_field: "v".to_string(),
                    target_type: TargetType::String,
                },
            ],
            passthrough: false,
        }),
    );
    spec.filter = FilterSpec {
        enabled: true,
        expression: "region == 'EU'".to_string(),
        strict: false,
    };
    let harness = Harness::new(&spec);

    harness.feed(json!({"id": 1, "v": "keep", "region": "EU"})).await.unwrap();
    harness.feed(json!({"id": 2, "v": "drop", "region": "US"})).await.unwrap();
    harness.feed(json!({"id": 1, "v": "dupe", "region": "EU"})).await.unwrap();

    let rows = harness.rows();
    let values: Vec<&str> = rows
        .iter()
        .map(|row| row["v"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["keep"]);
}

/// Every record is accounted for: emitted, filter/dedup-dropped, or on the
/// DLQ. Nothing vanishes.
#[tokio::test]
async fn test_dlq_totality() {
    let mut spec = pipeline(Some(60_000), None);
    spec.filter = FilterSpec {
        enabled: true,
        expression: "keep == true".to_string(),
        strict: true,
    };
    let harness = Harness::new(&spec);

    let inputs = vec![
        json!({"id": 1, "keep": true}),          // emitted
        json!({"id": 2, "keep": false}),         // filter drop
        json!({"id": 1, "keep": true}),          // dedup drop
        json!({"id": 3}),                        // strict filter: missing path
        json!({"keep": true}),                   // dedup key missing
    ];

    let mut emitted = 0;
    let mut dropped = 0;
    for record in inputs {
        match harness.feed(record).await.unwrap() {
            ChainOutput::Emit(_) => emitted += 1,
            ChainOutput::Drop => dropped += 1,
            ChainOutput::DeadLettered => {}
        }
    }

    assert_eq!(emitted, 1);
    assert_eq!(dropped, 2);
    assert_eq!(harness.dead_letters().len(), 2);
    assert_eq!(harness.rows().len(), 1);
}

mockall::mock! {
    Store {}

    #[async_trait]
    impl DedupStore for Store {
        async fn observe(&self, key: &[u8], ttl: Duration) -> Result<Observation>;
    }
}

/// A failing dedup backend dead-letters the record AND propagates the
/// error, so the role loop does not advance the offset past it.
#[tokio::test]
async fn test_dedup_backend_failure_path() {
    let mut store = MockStore::new();
    store
        .expect_observe()
        .returning(|_, _| Err(PipelineError::DedupBackend("disk full".to_string())));

    let spec = pipeline(Some(60_000), None);
    let harness = Harness::with_store(&spec, Arc::new(store));

    let err = harness.feed(json!({"id": 1, "v": "a"})).await.unwrap_err();
    assert!(matches!(err, PipelineError::DedupBackend(_)));
    assert_eq!(harness.dead_letters().len(), 1);
    assert!(harness.rows().is_empty());
}
