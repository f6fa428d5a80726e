//! Pipeline specification schema.
//!
//! A [`PipelineSpec`] binds one or two source topics to a columnar sink via
//! optional filter/dedup/transform/join stages. Specs are immutable after
//! creation except for the status block, and are persisted as UTF-8 JSON in
//! the `pipelines` KV bucket.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::status::PipelineStatus;

/// Pipeline ids are lowercase slugs; uniqueness is case-insensitive.
pub fn normalize_id(id: &str) -> String {
    id.to_ascii_lowercase()
}

fn id_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap())
}

/// Root pipeline specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSpec {
    /// Unique slug, case-insensitive unique within the catalog.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Source topics (1 or 2).
    pub source: SourceSpec,

    /// Per-record boolean predicate.
    #[serde(default)]
    pub filter: FilterSpec,

    /// Per-record projection/rename/type-coercion.
    #[serde(default)]
    pub stateless_transform: TransformSpec,

    /// Two-stream temporal join. Required iff two source topics are declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,

    /// Columnar sink configuration.
    pub sink: SinkSpec,

    /// Mutable status block.
    #[serde(default)]
    pub status: StatusBlock,
}

impl PipelineSpec {
    /// Validate the spec. Violations are `ConfigInvalid` and must be caught
    /// before anything is persisted or materialized.
    pub fn validate(&self) -> Result<()> {
        if !id_pattern().is_match(&normalize_id(&self.id)) {
            return Err(PipelineError::ConfigInvalid(format!(
                "pipeline id `{}` is not a slug ([a-z0-9][a-z0-9-]*)",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "pipeline name must not be empty".to_string(),
            ));
        }

        let topics = &self.source.topics;
        if topics.is_empty() || topics.len() > 2 {
            return Err(PipelineError::ConfigInvalid(format!(
                "expected 1 or 2 source topics, got {}",
                topics.len()
            )));
        }

        for topic in topics {
            if topic.name.trim().is_empty() {
                return Err(PipelineError::ConfigInvalid(
                    "source topic name must not be empty".to_string(),
                ));
            }
            if topic.replicas == 0 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "topic `{}`: replicas must be >= 1",
                    topic.name
                )));
            }
            if let Some(dedup) = &topic.deduplication {
                if dedup.enabled && dedup.key_path.trim().is_empty() {
                    return Err(PipelineError::ConfigInvalid(format!(
                        "topic `{}`: deduplication enabled without a key path",
                        topic.name
                    )));
                }
            }
        }

        match (&self.join, topics.len()) {
            (None, 2) => {
                return Err(PipelineError::ConfigInvalid(
                    "two source topics require a join configuration".to_string(),
                ));
            }
            (Some(join), 1) if join.enabled => {
                return Err(PipelineError::ConfigInvalid(
                    "join requires exactly two source topics".to_string(),
                ));
            }
            (Some(join), 2) => join.validate()?,
            _ => {}
        }

        if self.filter.enabled && self.filter.expression.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "filter enabled without an expression".to_string(),
            ));
        }
        if self.stateless_transform.enabled && self.stateless_transform.mappings.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "transform enabled without mappings".to_string(),
            ));
        }

        self.sink.validate()?;
        self.validate_stream_ids()
    }

    /// Output stream ids must be pairwise distinct across all stages and
    /// namespaced by the pipeline id so pipelines never share streams.
    fn validate_stream_ids(&self) -> Result<()> {
        let prefix = format!("{}.", normalize_id(&self.id));
        let mut seen = std::collections::HashSet::new();
        for id in self.output_stream_ids() {
            if !id.starts_with(&prefix) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "output stream id `{id}` is not namespaced by `{prefix}`"
                )));
            }
            if !seen.insert(id.clone()) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "output stream id `{id}` is used by more than one stage"
                )));
            }
        }
        Ok(())
    }

    fn output_stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .source
            .topics
            .iter()
            .map(|t| t.output_stream_id.clone())
            .collect();
        if let Some(join) = &self.join {
            if join.enabled {
                ids.push(join.output_stream_id.clone());
            }
        }
        ids
    }

    /// Whether the pipeline joins two streams.
    pub fn has_join(&self) -> bool {
        self.join.as_ref().map(|j| j.enabled).unwrap_or(false) && self.source.topics.len() == 2
    }

    /// Look up a source topic spec by name.
    pub fn topic(&self, name: &str) -> Option<&TopicSpec> {
        self.source.topics.iter().find(|t| t.name == name)
    }

    /// Touch the status block with a new overall state.
    pub fn set_status(&mut self, status: PipelineStatus) {
        self.status.overall = status;
        self.status.updated_at = Utc::now();
    }
}

/// Set of source topics feeding the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSpec {
    pub topics: Vec<TopicSpec>,
}

/// One Kafka source topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSpec {
    /// Kafka topic name.
    pub name: String,

    /// Bus stream the dedup/transform stage publishes into.
    pub output_stream_id: String,

    /// Horizontal scale of the per-topic roles.
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Optional deduplication for this topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DedupSpec>,
}

fn default_replicas() -> u32 {
    1
}

impl TopicSpec {
    /// Dedup config if present and enabled.
    pub fn dedup(&self) -> Option<&DedupSpec> {
        self.deduplication.as_ref().filter(|d| d.enabled)
    }
}

/// Deduplication window for one topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Dotted path to the dedup key inside the record.
    pub key_path: String,

    /// Absolute key lifetime in milliseconds, measured from first observation.
    pub window_ms: u64,
}

impl DedupSpec {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-record boolean predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Restricted expression grammar: comparisons, and/or/not, dotted paths.
    #[serde(default)]
    pub expression: String,

    /// In strict mode a missing path is an evaluation error (dead letter);
    /// otherwise the comparison is simply false.
    #[serde(default)]
    pub strict: bool,
}

/// Declarative per-record projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mappings: Vec<FieldMapping>,

    /// Keep unmapped fields instead of dropping them.
    #[serde(default)]
    pub passthrough: bool,
}

/// One field mapping of the stateless transform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMapping {
    /// Dotted source path.
    pub source_path: String,

    /// Target field name in the output record.
    pub target_field: String,

    /// Declared target type.
    pub target_type: TargetType,
}

/// Types a mapped value can be coerced to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
}

/// Temporal join of two streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "type", default)]
    pub join_type: JoinType,

    /// Bus stream joined records are published into.
    pub output_stream_id: String,

    /// Exactly two sources, one per orientation.
    pub sources: Vec<JoinSourceSpec>,
}

impl JoinSpec {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.sources.len() != 2 {
            return Err(PipelineError::ConfigInvalid(format!(
                "join requires exactly 2 sources, got {}",
                self.sources.len()
            )));
        }
        let lefts = self
            .sources
            .iter()
            .filter(|s| s.orientation == JoinOrientation::Left)
            .count();
        if lefts != 1 {
            return Err(PipelineError::ConfigInvalid(
                "join sources must cover exactly {left, right}".to_string(),
            ));
        }
        for source in &self.sources {
            if source.key_path.trim().is_empty() {
                return Err(PipelineError::ConfigInvalid(format!(
                    "join source `{}` has an empty key path",
                    source.stream_id
                )));
            }
        }
        Ok(())
    }

    /// Source spec for the given orientation. Callers run after validation,
    /// so exactly one source per orientation exists.
    pub fn source(&self, orientation: JoinOrientation) -> Option<&JoinSourceSpec> {
        self.sources.iter().find(|s| s.orientation == orientation)
    }
}

/// Supported join algorithms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Temporal,
}

/// One side of the join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinSourceSpec {
    /// Upstream bus stream id (a dedup output stream).
    pub stream_id: String,

    pub orientation: JoinOrientation,

    /// Dotted path to the join key inside the record.
    pub key_path: String,

    /// Per-side buffer entry lifetime in milliseconds.
    pub buffer_ttl_ms: u64,
}

impl JoinSourceSpec {
    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_millis(self.buffer_ttl_ms)
    }
}

/// Which side of the join a source feeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JoinOrientation {
    Left,
    Right,
}

impl JoinOrientation {
    pub fn opposite(&self) -> JoinOrientation {
        match self {
            JoinOrientation::Left => JoinOrientation::Right,
            JoinOrientation::Right => JoinOrientation::Left,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JoinOrientation::Left => "left",
            JoinOrientation::Right => "right",
        }
    }
}

impl std::fmt::Display for JoinOrientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columnar sink stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkSpec {
    /// Sink backend type; `clickhouse` is the only built-in.
    #[serde(rename = "type", default = "default_sink_type")]
    pub sink_type: String,

    /// Bus stream the sink consumes (a dedup output stream or the join stream).
    pub stream_id: String,

    pub batch: BatchSpec,

    /// Record-to-column schema mapping.
    pub column_mapping: Vec<ColumnMapping>,

    pub connection: SinkConnection,
}

fn default_sink_type() -> String {
    "clickhouse".to_string()
}

impl SinkSpec {
    fn validate(&self) -> Result<()> {
        if self.batch.max_size == 0 {
            return Err(PipelineError::ConfigInvalid(
                "sink batch max_size must be >= 1".to_string(),
            ));
        }
        if self.column_mapping.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "sink column mapping must not be empty".to_string(),
            ));
        }
        if self.connection.url.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "sink connection url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch assembly bounds for the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSpec {
    /// Maximum records per sink insert.
    pub max_size: usize,

    /// Maximum time to hold an incomplete batch, in milliseconds.
    pub max_delay_ms: u64,
}

impl BatchSpec {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// One record-field-to-column mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMapping {
    /// Dotted source path inside the (possibly joined) record.
    pub source_path: String,

    /// Target column name.
    pub column: String,

    /// Declared column type; values are coerced on the way in.
    pub column_type: TargetType,
}

/// Connection details for the columnar store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkConnection {
    /// HTTP endpoint, e.g. `http://clickhouse:8123`.
    pub url: String,

    pub database: String,

    pub table: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Mutable status block carried inside the catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusBlock {
    pub overall: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusBlock {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            overall: PipelineStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}
