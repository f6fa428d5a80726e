//! Canonical stream, subject and consumer naming.
//!
//! All bus names are derived from the pipeline id so streams of different
//! pipelines never collide. Subjects within a stream are `<stream>.<shard>`;
//! consumers read the wildcard `<stream>.*` unless pinned to one shard.

use crate::models::pipeline::PipelineSpec;

/// Input stream for one source topic: `<pid>.in.<topic>`.
pub fn input_stream(pipeline_id: &str, topic: &str) -> String {
    format!("{pipeline_id}.in.{topic}")
}

/// Dedup/transform output stream: `<pid>.dedup.<topic>`.
pub fn dedup_stream(pipeline_id: &str, topic: &str) -> String {
    format!("{pipeline_id}.dedup.{topic}")
}

/// Joined output stream: `<pid>.join`.
pub fn join_stream(pipeline_id: &str) -> String {
    format!("{pipeline_id}.join")
}

/// Dead-letter stream: `<pid>.dlq`.
pub fn dlq_stream(pipeline_id: &str) -> String {
    format!("{pipeline_id}.dlq")
}

/// Concrete subject for one shard of a stream.
pub fn subject(stream: &str, shard: u32) -> String {
    format!("{stream}.{shard}")
}

/// Wildcard subject covering every shard of a stream.
pub fn wildcard(stream: &str) -> String {
    format!("{stream}.*")
}

/// Durable consumer name: `<pid>.<role>[.<topic>][.<shard>]`.
///
/// Names are stable across restarts so redeliveries resume where the
/// previous worker instance stopped.
pub fn consumer_name(
    pipeline_id: &str,
    role: &str,
    topic: Option<&str>,
    shard: Option<u32>,
) -> String {
    let mut name = format!("{pipeline_id}.{role}");
    if let Some(topic) = topic {
        name.push('.');
        name.push_str(topic);
    }
    if let Some(shard) = shard {
        name.push('.');
        name.push_str(&shard.to_string());
    }
    name
}

/// Every stream a pipeline owns, in creation order. Input and DLQ streams
/// are derived; stage output streams use the ids declared in the spec
/// (which follow the `<pid>.dedup.<topic>` / `<pid>.join` convention).
pub fn all_streams(spec: &PipelineSpec) -> Vec<String> {
    let mut streams = Vec::new();
    for topic in &spec.source.topics {
        streams.push(input_stream(&spec.id, &topic.name));
        streams.push(topic.output_stream_id.clone());
    }
    if spec.has_join() {
        if let Some(join) = &spec.join {
            streams.push(join.output_stream_id.clone());
        }
    }
    streams.push(dlq_stream(&spec.id));
    streams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_is_namespaced_by_pipeline() {
        assert_eq!(input_stream("p1", "t1"), "p1.in.t1");
        assert_eq!(dedup_stream("p1", "t1"), "p1.dedup.t1");
        assert_eq!(join_stream("p1"), "p1.join");
        assert_eq!(dlq_stream("p1"), "p1.dlq");
        assert_eq!(subject("p1.in.t1", 0), "p1.in.t1.0");
        assert_eq!(wildcard("p1.in.t1"), "p1.in.t1.*");
    }

    #[test]
    fn test_consumer_names_are_deterministic() {
        assert_eq!(consumer_name("p1", "sink", None, None), "p1.sink");
        assert_eq!(
            consumer_name("p1", "dedup", Some("t1"), None),
            "p1.dedup.t1"
        );
        assert_eq!(
            consumer_name("p1", "dedup", Some("t1"), Some(2)),
            "p1.dedup.t1.2"
        );
    }
}
