//! Stateless per-record projection.
//!
//! The mapping spec is compiled once at startup into a [`TransformPlan`];
//! applying it extracts the named paths, coerces values to their declared
//! types and emits the projected record. Unmapped fields are dropped unless
//! the spec asks for passthrough.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result, TransformErrorKind};
use crate::models::{FieldMapping, TargetType, TransformSpec};
use crate::pipeline::path::JsonPath;
use crate::pipeline::processor::{Outcome, Processor};

/// One compiled mapping operation.
#[derive(Debug, Clone)]
struct MappingOp {
    path: JsonPath,
    target: String,
    target_type: TargetType,
}

/// Compiled projection plan.
#[derive(Debug, Clone)]
pub struct TransformPlan {
    ops: Vec<MappingOp>,
    passthrough: bool,
}

impl TransformPlan {
    /// Compile the declarative mapping spec.
    pub fn compile(spec: &TransformSpec) -> Result<Self> {
        let ops = spec
            .mappings
            .iter()
            .map(|mapping| {
                Ok(MappingOp {
                    path: JsonPath::compile(&mapping.source_path)?,
                    target: mapping.target_field.clone(),
                    target_type: mapping.target_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ops,
            passthrough: spec.passthrough,
        })
    }

    /// Compile a bare mapping list (used by the sink's schema mapping).
    pub fn from_mappings(mappings: &[FieldMapping]) -> Result<Self> {
        Self::compile(&TransformSpec {
            enabled: true,
            mappings: mappings.to_vec(),
            passthrough: false,
        })
    }

    /// Apply the plan to one record.
    pub fn apply(&self, record: &Value) -> Result<Value> {
        let mut output = if self.passthrough {
            match record {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            }
        } else {
            Map::new()
        };

        for op in &self.ops {
            let value = op.path.require(record)?;
            let coerced = coerce(value, op.target_type).map_err(|kind| PipelineError::Transform {
                path: op.path.raw().to_string(),
                kind,
            })?;
            output.insert(op.target.clone(), coerced);
        }

        Ok(Value::Object(output))
    }
}

/// Coerce a JSON value to the declared target type.
///
/// Timestamps accept RFC 3339 strings (normalized on the way through) and
/// integers interpreted as epoch milliseconds.
pub fn coerce(value: &Value, target: TargetType) -> std::result::Result<Value, TransformErrorKind> {
    use TransformErrorKind::TypeMismatch;

    let coerced = match (target, value) {
        (TargetType::String, Value::String(s)) => Value::String(s.clone()),
        (TargetType::String, Value::Number(n)) => Value::String(n.to_string()),
        (TargetType::String, Value::Bool(b)) => Value::String(b.to_string()),

        (TargetType::Int, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Value::from(f as i64)
                } else {
                    return Err(TypeMismatch);
                }
            } else {
                return Err(TypeMismatch);
            }
        }
        (TargetType::Int, Value::String(s)) => {
            Value::from(s.trim().parse::<i64>().map_err(|_| TypeMismatch)?)
        }

        (TargetType::Float, Value::Number(n)) => {
            Value::from(n.as_f64().ok_or(TypeMismatch)?)
        }
        (TargetType::Float, Value::String(s)) => {
            Value::from(s.trim().parse::<f64>().map_err(|_| TypeMismatch)?)
        }

        (TargetType::Bool, Value::Bool(b)) => Value::Bool(*b),
        (TargetType::Bool, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(TypeMismatch),
        },

        (TargetType::Timestamp, Value::String(s)) => {
            let parsed: DateTime<Utc> = s.parse().map_err(|_| TypeMismatch)?;
            Value::String(parsed.to_rfc3339())
        }
        (TargetType::Timestamp, Value::Number(n)) => {
            let millis = n.as_i64().ok_or(TypeMismatch)?;
            let parsed = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or(TypeMismatch)?;
            Value::String(parsed.to_rfc3339())
        }

        _ => return Err(TypeMismatch),
    };

    Ok(coerced)
}

/// Processor wrapper around a compiled plan.
pub struct TransformProcessor {
    plan: TransformPlan,
}

impl TransformProcessor {
    pub fn new(plan: TransformPlan) -> Self {
        Self { plan }
    }

    pub fn from_spec(spec: &TransformSpec) -> Result<Self> {
        Ok(Self::new(TransformPlan::compile(spec)?))
    }
}

#[async_trait]
impl Processor for TransformProcessor {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn process(&self, record: Value) -> Outcome {
        match self.plan.apply(&record) {
            Ok(projected) => Outcome::Emit(projected),
            Err(e) => Outcome::Fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldMapping;
    use serde_json::json;

    fn plan(mappings: Vec<FieldMapping>, passthrough: bool) -> TransformPlan {
        TransformPlan::compile(&TransformSpec {
            enabled: true,
            mappings,
            passthrough,
        })
        .unwrap()
    }

    fn mapping(source: &str, target: &str, ty: TargetType) -> FieldMapping {
        FieldMapping {
            source_path: source.to_string(),
            target_field: target.to_string(),
            target_type: ty,
        }
    }

    #[test]
    fn test_projection_and_rename() {
        let plan = plan(
            vec![
                mapping("user.id", "uid", TargetType::Int),
                mapping("amount", "amount", TargetType::Float),
            ],
            false,
        );
        let record = json!({"user": {"id": 7}, "amount": "12.5", "noise": true});
        let output = plan.apply(&record).unwrap();
        assert_eq!(output, json!({"uid": 7, "amount": 12.5}));
    }

    #[test]
    fn test_passthrough_keeps_unmapped_fields() {
        let plan = plan(vec![mapping("id", "id", TargetType::Int)], true);
        let record = json!({"id": "3", "extra": "kept"});
        let output = plan.apply(&record).unwrap();
        assert_eq!(output, json!({"id": 3, "extra": "kept"}));
    }

    #[test]
    fn test_missing_path_fails() {
        let plan = plan(vec![mapping("absent", "absent", TargetType::String)], false);
        let err = plan.apply(&json!({})).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transform {
                kind: TransformErrorKind::MissingPath,
                ..
            }
        ));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let plan = plan(vec![mapping("amt", "amt", TargetType::Int)], false);
        let err = plan.apply(&json!({"amt": "oops"})).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transform {
                kind: TransformErrorKind::TypeMismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_timestamp_coercion() {
        let rfc = coerce(&json!("2026-03-01T00:00:00Z"), TargetType::Timestamp).unwrap();
        assert_eq!(rfc, json!("2026-03-01T00:00:00+00:00"));

        let epoch = coerce(&json!(1_767_225_600_000i64), TargetType::Timestamp).unwrap();
        assert!(epoch.as_str().unwrap().starts_with("2026-01-01T00:00:00"));

        assert!(coerce(&json!("not a date"), TargetType::Timestamp).is_err());
    }

    #[test]
    fn test_integral_float_coerces_to_int() {
        assert_eq!(coerce(&json!(3.0), TargetType::Int).unwrap(), json!(3));
        assert!(coerce(&json!(3.5), TargetType::Int).is_err());
    }
}
