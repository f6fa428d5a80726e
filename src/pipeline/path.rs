//! Dotted-path access into record JSON.
//!
//! The same extraction rules back the filter, the stateless transform, the
//! dedup key and the join key, so a path behaves identically wherever it
//! appears in a pipeline spec.

use serde_json::Value;

use crate::error::{PipelineError, Result, TransformErrorKind};

/// A compiled dotted path (`a.b.c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonPath {
    raw: String,
    segments: Vec<String>,
}

impl JsonPath {
    /// Compile a dotted path. Empty paths and empty segments are rejected at
    /// startup rather than surfacing per record.
    pub fn compile(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "path must not be empty".to_string(),
            ));
        }
        let segments: Vec<String> = trimmed.split('.').map(|s| s.to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PipelineError::ConfigInvalid(format!(
                "path `{trimmed}` contains an empty segment"
            )));
        }
        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Walk the record; `None` when any segment is missing or a non-object
    /// is traversed.
    pub fn lookup<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        let mut current = record;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Like [`lookup`](Self::lookup) but a missing path is a typed error.
    pub fn require<'a>(&self, record: &'a Value) -> Result<&'a Value> {
        self.lookup(record).ok_or_else(|| PipelineError::Transform {
            path: self.raw.clone(),
            kind: TransformErrorKind::MissingPath,
        })
    }

    /// Canonical bytes of the value at this path, used for dedup and join
    /// keys. Strings contribute their raw bytes so `"a"` and `a` rendered
    /// through JSON do not diverge; everything else uses its JSON form.
    pub fn key_bytes(&self, record: &Value) -> Result<Vec<u8>> {
        let value = self.require(record)?;
        Ok(match value {
            Value::String(s) => s.as_bytes().to_vec(),
            other => serde_json::to_vec(other).unwrap_or_default(),
        })
    }
}
