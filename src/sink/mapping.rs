//! Record-to-column schema mapping.

use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::models::ColumnMapping;
use crate::pipeline::path::JsonPath;
use crate::pipeline::transform::coerce;

/// One compiled column.
#[derive(Debug, Clone)]
struct CompiledColumn {
    path: JsonPath,
    column: String,
    column_type: crate::models::TargetType,
}

/// Compiled schema mapping from record paths to sink columns.
#[derive(Debug, Clone)]
pub struct SchemaMapping {
    columns: Vec<CompiledColumn>,
}

impl SchemaMapping {
    pub fn compile(mappings: &[ColumnMapping]) -> Result<Self> {
        let columns = mappings
            .iter()
            .map(|mapping| {
                Ok(CompiledColumn {
                    path: JsonPath::compile(&mapping.source_path)?,
                    column: mapping.column.clone(),
                    column_type: mapping.column_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if columns.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "schema mapping must define at least one column".to_string(),
            ));
        }

        Ok(Self { columns })
    }

    /// Column names in declaration order, as they appear in the insert.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column.as_str()).collect()
    }

    /// Map one record onto a row. Failures are per-record schema-mapping
    /// errors (dead letter), never batch failures.
    pub fn map_record(&self, record: &Value) -> Result<Map<String, Value>> {
        let mut row = Map::with_capacity(self.columns.len());

        for column in &self.columns {
            let value = column.path.lookup(record).ok_or_else(|| {
                PipelineError::SchemaMapping {
                    column: column.column.clone(),
                    message: format!("path `{}` missing from record", column.path.raw()),
                }
            })?;
            let coerced = coerce(value, column.column_type).map_err(|kind| {
                PipelineError::SchemaMapping {
                    column: column.column.clone(),
                    message: format!("path `{}`: {kind}", column.path.raw()),
                }
            })?;
            row.insert(column.column.clone(), coerced);
        }

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;
    use serde_json::json;

    fn mapping() -> SchemaMapping {
        SchemaMapping::compile(&[
            ColumnMapping {
                source_path: "left.uid".to_string(),
                column: "uid".to_string(),
                column_type: TargetType::Int,
            },
            ColumnMapping {
                source_path: "left.amt".to_string(),
                column: "amount".to_string(),
                column_type: TargetType::Float,
            },
            ColumnMapping {
                source_path: "right.geo".to_string(),
                column: "geo".to_string(),
                column_type: TargetType::String,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_maps_joined_record_onto_columns() {
        let row = mapping()
            .map_record(&json!({
                "left": {"uid": 9, "amt": 10},
                "right": {"geo": "EU"},
            }))
            .unwrap();

        assert_eq!(row.get("uid"), Some(&json!(9)));
        assert_eq!(row.get("amount"), Some(&json!(10.0)));
        assert_eq!(row.get("geo"), Some(&json!("EU")));
    }

    #[test]
    fn test_missing_column_path_is_schema_error() {
        let err = mapping().map_record(&json!({"left": {"uid": 9}})).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMapping { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::PoisonRecord);
    }

    #[test]
    fn test_column_order_is_declaration_order() {
        assert_eq!(mapping().column_names(), vec!["uid", "amount", "geo"]);
    }
}
