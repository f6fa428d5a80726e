//! Local orchestrator and component-planning tests.

use std::path::PathBuf;

use pretty_assertions::assert_eq;
use streamforge::error::PipelineError;
use streamforge::models::{
    BatchSpec, ColumnMapping, DedupSpec, FilterSpec, JoinOrientation, JoinSourceSpec, JoinSpec,
    JoinType, PipelineSpec, SinkConnection, SinkSpec, SourceSpec, TargetType, TopicSpec,
    TransformSpec,
};
use streamforge::orchestrator::{
    planned_components, LocalOrchestrator, Orchestrator,
};
use streamforge::orchestrator::local::LocalOrchestratorConfig;
use streamforge::runtime::Role;

fn sink(stream_id: &str) -> SinkSpec {
    SinkSpec {
        sink_type: "clickhouse".to_string(),
        stream_id: stream_id.to_string(),
        batch: BatchSpec {
            max_size: 100,
            max_delay_ms: 500,
        },
        column_mapping: vec![ColumnMapping {
            source_path: "id".to_string(),
            column: "id".to_string(),
            column_type: TargetType::Int,
        }],
        connection: SinkConnection {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            table: "tbl".to_string(),
            username: None,
            password: None,
        },
    }
}

fn single_topic(id: &str, replicas: u32) -> PipelineSpec {
    PipelineSpec {
        id: id.to_string(),
        name: id.to_string(),
        source: SourceSpec {
            topics: vec![TopicSpec {
                name: "t1".to_string(),
                output_stream_id: format!("{id}.dedup.t1"),
                replicas,
                deduplication: Some(DedupSpec {
                    enabled: true,
                    key_path: "id".to_string(),
                    window_ms: 1000,
                }),
            }],
        },
        filter: FilterSpec::default(),
        stateless_transform: TransformSpec::default(),
        join: None,
        sink: sink(&format!("{id}.dedup.t1")),
        status: Default::default(),
    }
}

fn joined(id: &str) -> PipelineSpec {
    let mut spec = single_topic(id, 1);
    spec.source.topics.push(TopicSpec {
        name: "t2".to_string(),
        output_stream_id: format!("{id}.dedup.t2"),
        replicas: 1,
        deduplication: None,
    });
    spec.join = Some(JoinSpec {
        enabled: true,
        join_type: JoinType::Temporal,
        output_stream_id: format!("{id}.join"),
        sources: vec![
            JoinSourceSpec {
                stream_id: format!("{id}.dedup.t1"),
                orientation: JoinOrientation::Left,
                key_path: "uid".to_string(),
                buffer_ttl_ms: 5000,
            },
            JoinSourceSpec {
                stream_id: format!("{id}.dedup.t2"),
                orientation: JoinOrientation::Right,
                key_path: "uid".to_string(),
                buffer_ttl_ms: 5000,
            },
        ],
    });
    spec.sink.stream_id = format!("{id}.join");
    spec
}

#[test]
fn test_single_topic_component_plan() {
    let spec = single_topic("p1", 2);
    spec.validate().unwrap();

    let components = planned_components(&spec);
    assert_eq!(
        components,
        vec![
            (Role::Ingestor, Some("t1".to_string()), 2),
            (Role::Dedup, Some("t1".to_string()), 2),
            (Role::Sink, None, 1),
        ]
    );
}

#[test]
fn test_joined_component_plan() {
    let spec = joined("p2");
    spec.validate().unwrap();

    let components = planned_components(&spec);
    assert_eq!(components.len(), 6);
    assert!(components.contains(&(Role::Join, None, 1)));
    assert_eq!(
        components
            .iter()
            .filter(|(role, _, _)| *role == Role::Ingestor)
            .count(),
        2
    );
}

fn local_orchestrator(dir: &tempfile::TempDir) -> LocalOrchestrator {
    LocalOrchestrator::new(LocalOrchestratorConfig {
        // `sleep` with no argument exits immediately, which is all these
        // tests need: spawning succeeds and bookkeeping can be observed.
        worker_binary: PathBuf::from("/bin/sleep"),
        config_dir: dir.path().to_path_buf(),
        bus_url: "nats://localhost:4222".to_string(),
        kafka_brokers: "localhost:9092".to_string(),
        redis_url: None,
    })
}

#[tokio::test]
async fn test_unknown_pipeline_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = local_orchestrator(&dir);

    for result in [
        orchestrator.stop_pipeline("ghost").await,
        orchestrator.pause_pipeline("ghost").await,
        orchestrator.resume_pipeline("ghost").await,
        orchestrator.terminate_pipeline("ghost").await,
        orchestrator.check_component_health("ghost").await.map(|_| ()),
    ] {
        assert!(
            matches!(result, Err(PipelineError::PipelineNotFound(_))),
            "{result:?}"
        );
    }
}

#[tokio::test]
async fn test_setup_writes_spec_and_tracks_workers() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = local_orchestrator(&dir);

    let spec = single_topic("p1", 1);
    spec.validate().unwrap();
    orchestrator.setup_pipeline(&spec).await.unwrap();

    let spec_path = dir.path().join("p1.json");
    assert!(spec_path.exists());
    let written: PipelineSpec =
        serde_json::from_slice(&std::fs::read(&spec_path).unwrap()).unwrap();
    assert_eq!(written.id, "p1");

    // ingestor + dedup + sink, one worker each.
    let health = orchestrator.check_component_health("p1").await.unwrap();
    assert_eq!(health.components.len(), 3);
}

#[tokio::test]
async fn test_terminate_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = local_orchestrator(&dir);

    let spec = single_topic("p3", 1);
    orchestrator.setup_pipeline(&spec).await.unwrap();
    orchestrator.terminate_pipeline("p3").await.unwrap();

    assert!(!dir.path().join("p3.json").exists());
    assert!(matches!(
        orchestrator.check_component_health("p3").await,
        Err(PipelineError::PipelineNotFound(_))
    ));
}
