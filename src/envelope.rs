//! The canonical envelope model.
//!
//! `DataEnvelope` is the unit of dataflow between nodes: an ordered sequence
//! of records plus metadata describing their schema and provenance. Every
//! connector receives and returns one. Schema inference follows a "walk the
//! data, never panic" style: every observed value gets classified into the
//! closed field-type set without ever failing on an unexpected shape.

use crate::error::{EngineError, Result};
use crate::value::Record;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of field types a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Id of the node that originally produced this field. Empty when the
    /// field has no single producer (e.g. was introduced by a transform with
    /// no source).
    #[serde(default)]
    pub source_node: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType, source_node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type,
            source_node: source_node.into(),
            nullable: false,
            description: None,
        }
    }
}

/// An ordered sequence of field definitions plus the set of node ids that
/// contributed fields. `source_nodes` is a set: order is not observable and
/// duplicates are not meaningful, but we store it as a `Vec` to keep
/// (de)serialization simple, deduplicating on insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSchema {
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub source_nodes: Vec<String>,
}

impl DataSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn push_source_node(&mut self, node_id: &str) {
        if !node_id.is_empty() && !self.source_nodes.iter().any(|n| n == node_id) {
            self.source_nodes.push(node_id.to_string());
        }
    }

    /// "Inferred at runtime" is signalled by an empty fields list — a
    /// connector whose static output shape can't be known ahead of
    /// execution (HTTP response, arbitrary script) returns this.
    pub fn is_inferred_at_runtime(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub record_count: usize,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub schema: DataSchema,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub custom: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub data: Vec<Record>,
    pub metadata: Metadata,
}

impl DataEnvelope {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Deterministic serialization with stable keys `data`/`metadata`. Never
    /// emits language-specific sentinels (NaN, `undefined`, etc.) — every
    /// value in `data`/`custom` already came from `serde_json::Value`, which
    /// cannot represent those.
    pub fn to_map(&self) -> Value {
        serde_json::to_value(self).expect("DataEnvelope is always representable as JSON")
    }

    /// Tolerant of three shapes:
    /// - canonical: `{"data": [...], "metadata": {...}}`
    /// - a raw sequence, interpreted as `data` with empty metadata
    /// - a legacy mapping with `records` instead of `data`
    ///
    /// Fails with `MalformedEnvelope` only if the `data`/`records` value,
    /// when present, is not a sequence of records.
    pub fn from_map(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(Self {
                data: records_from_values(items)?,
                metadata: Metadata::default(),
            }),
            Value::Object(mut obj) => {
                let raw_data = obj.remove("data").or_else(|| obj.remove("records"));
                let data = match raw_data {
                    Some(Value::Array(items)) => records_from_values(items)?,
                    Some(other) => {
                        return Err(EngineError::MalformedEnvelope(format!(
                            "expected `data` to be a sequence of records, got {other}"
                        )))
                    }
                    None => Vec::new(),
                };
                let metadata = match obj.remove("metadata") {
                    Some(m) => serde_json::from_value(m).map_err(|e| {
                        EngineError::MalformedEnvelope(format!("invalid metadata: {e}"))
                    })?,
                    None => Metadata::default(),
                };
                Ok(Self { data, metadata })
            }
            other => Err(EngineError::MalformedEnvelope(format!(
                "envelope must be a mapping or a sequence, got {other}"
            ))),
        }
    }
}

fn records_from_values(items: Vec<Value>) -> Result<Vec<Record>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(EngineError::MalformedEnvelope(format!(
                "expected record to be a mapping, got {other}"
            ))),
        })
        .collect()
}

/// Classify a single observed value into the closed field-type set.
/// Null values get the default `string` tag; callers that track nullability
/// across records set `nullable` separately.
pub fn infer_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::String,
        Value::Bool(_) => FieldType::Boolean,
        Value::Number(_) => FieldType::Number,
        Value::String(s) => {
            if looks_like_rfc3339(s) {
                FieldType::Date
            } else {
                FieldType::String
            }
        }
        Value::Array(_) | Value::Object(_) => FieldType::Json,
    }
}

fn looks_like_rfc3339(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
}

/// Scan every record, union field names, and derive a type for each via a
/// first-observation rule. Any later `null` observation for a field marks it
/// `nullable = true` regardless of the type chosen from the first non-null
/// (or null) observation.
///
/// Field ordering in the result is stable only up to set equality — callers
/// must compare as sets.
pub fn infer_schema(records: &[Record], producing_node_id: Option<&str>) -> DataSchema {
    let mut fields: Vec<FieldDefinition> = Vec::new();
    let mut seen_null: std::collections::HashSet<String> = std::collections::HashSet::new();

    for record in records {
        for (name, value) in record.iter() {
            if value.is_null() {
                seen_null.insert(name.clone());
            }
            if !fields.iter().any(|f| &f.name == name) {
                let field_type = infer_field_type(value);
                let mut field = FieldDefinition::new(
                    name.clone(),
                    field_type,
                    producing_node_id.unwrap_or(""),
                );
                field.nullable = value.is_null();
                fields.push(field);
            }
        }
    }

    for field in fields.iter_mut() {
        if seen_null.contains(&field.name) {
            field.nullable = true;
        }
    }

    let mut schema = DataSchema {
        fields,
        source_nodes: Vec::new(),
    };
    if let Some(node_id) = producing_node_id {
        schema.push_source_node(node_id);
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(pairs: &[(&str, Value)]) -> Record {
        let mut m = Map::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        m
    }

    #[test]
    fn round_trip_canonical_envelope() {
        let env = DataEnvelope {
            data: vec![rec(&[("a", json!(1))])],
            metadata: Metadata {
                node_id: "n1".into(),
                node_type: "csv_source".into(),
                record_count: 1,
                ..Metadata::default()
            },
        };
        let round_tripped = DataEnvelope::from_map(env.to_map()).unwrap();
        assert_eq!(round_tripped.data, env.data);
        assert_eq!(round_tripped.metadata.node_id, env.metadata.node_id);
        assert_eq!(round_tripped.metadata.record_count, env.metadata.record_count);
    }

    #[test]
    fn from_map_accepts_raw_sequence() {
        let value = json!([{"a": 1}, {"a": 2}]);
        let env = DataEnvelope::from_map(value).unwrap();
        assert_eq!(env.data.len(), 2);
        assert_eq!(env.metadata.node_id, "");
    }

    #[test]
    fn from_map_accepts_legacy_records_key() {
        let value = json!({"records": [{"a": 1}]});
        let env = DataEnvelope::from_map(value).unwrap();
        assert_eq!(env.data.len(), 1);
    }

    #[test]
    fn from_map_rejects_non_sequence_data() {
        let value = json!({"data": "not a sequence"});
        assert!(DataEnvelope::from_map(value).is_err());
    }

    #[test]
    fn infer_schema_nullability() {
        let records = vec![
            rec(&[("name", json!("Alice")), ("age", Value::Null)]),
            rec(&[("name", json!("Bob")), ("age", json!(30))]),
        ];
        let schema = infer_schema(&records, Some("n1"));
        assert!(schema.field("age").unwrap().nullable);
        assert_eq!(schema.field("name").unwrap().field_type, FieldType::String);
        assert_eq!(schema.source_nodes, vec!["n1".to_string()]);
    }

    #[test]
    fn infer_schema_empty_records_yields_empty_schema() {
        let schema = infer_schema(&[], Some("n1"));
        assert!(schema.fields.is_empty());
        assert_eq!(schema.source_nodes, vec!["n1".to_string()]);
    }

    #[test]
    fn infer_schema_empty_records_no_node_yields_empty_source_nodes() {
        let schema = infer_schema(&[], None);
        assert!(schema.source_nodes.is_empty());
    }

    #[test]
    fn infer_field_type_classifies_closed_set() {
        assert_eq!(infer_field_type(&json!(true)), FieldType::Boolean);
        assert_eq!(infer_field_type(&json!(1.5)), FieldType::Number);
        assert_eq!(infer_field_type(&json!("hello")), FieldType::String);
        assert_eq!(infer_field_type(&json!("2024-01-01T00:00:00Z")), FieldType::Date);
        assert_eq!(infer_field_type(&json!([1, 2])), FieldType::Json);
        assert_eq!(infer_field_type(&json!({"a": 1})), FieldType::Json);
        assert_eq!(infer_field_type(&Value::Null), FieldType::String);
    }
}
