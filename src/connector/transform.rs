//! Field-transform processor.
//!
//! Generalizes simple single-field path extraction into an ordered pipeline
//! of named operations that both rewrite records and evolve the declared
//! schema in lockstep.

use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{infer_field_type, DataEnvelope, DataSchema, FieldDefinition, FieldType, Metadata};
use crate::error::{EngineError, Result};
use crate::value::Record;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
enum Op {
    Rename { source: String, target: String },
    Delete { source: String },
    Add { target: String, value: Option<Value>, expression: Option<String> },
    Modify { source: String, value: Option<Value>, expression: Option<String> },
    Cast { source: String, target: Option<String>, to_type: FieldType },
    Copy { source: String, target: String },
    Lowercase { source: String },
    Uppercase { source: String },
    Trim { source: String },
    Replace { source: String, old_value: String, new_value: String },
    Concat { sources: Vec<String>, target: String, separator: String },
    Split { source: String, target: String, separator: String },
    FormatDate { source: String, target: Option<String>, date_format: String },
    ParseDate { source: String, target: Option<String>, date_format: String },
}

fn parse_to_type(raw: &str) -> Result<FieldType> {
    match raw {
        "string" => Ok(FieldType::String),
        "number" => Ok(FieldType::Number),
        "boolean" => Ok(FieldType::Boolean),
        "date" => Ok(FieldType::Date),
        other => Err(EngineError::Config(format!("cast: unknown to_type '{other}'"))),
    }
}

fn parse_op(value: &Value) -> Result<Op> {
    let str_field = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Config(format!("transform op missing '{key}'")))
    };
    let opt_str = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

    let op_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Config("transform op missing 'type'".to_string()))?;

    Ok(match op_type {
        "rename" => Op::Rename { source: str_field("source")?, target: str_field("target")? },
        "delete" => Op::Delete { source: str_field("source")? },
        "add" => Op::Add {
            target: str_field("target")?,
            value: value.get("value").cloned(),
            expression: opt_str("expression"),
        },
        "modify" => Op::Modify {
            source: str_field("source")?,
            value: value.get("value").cloned(),
            expression: opt_str("expression"),
        },
        "cast" => Op::Cast {
            source: str_field("source")?,
            target: opt_str("target"),
            to_type: parse_to_type(&str_field("to_type")?)?,
        },
        "copy" => Op::Copy { source: str_field("source")?, target: str_field("target")? },
        "lowercase" => Op::Lowercase { source: str_field("source")? },
        "uppercase" => Op::Uppercase { source: str_field("source")? },
        "trim" => Op::Trim { source: str_field("source")? },
        "replace" => Op::Replace {
            source: str_field("source")?,
            old_value: str_field("old_value")?,
            new_value: str_field("new_value")?,
        },
        "concat" => {
            let sources = match value.get("source") {
                Some(Value::Array(items)) => {
                    items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                }
                Some(Value::String(s)) => s.split(',').map(|p| p.trim().to_string()).collect(),
                _ => return Err(EngineError::Config("concat requires 'source' as a list or comma-separated string".to_string())),
            };
            Op::Concat {
                sources,
                target: str_field("target")?,
                separator: opt_str("separator").unwrap_or_else(|| ",".to_string()),
            }
        }
        "split" => Op::Split {
            source: str_field("source")?,
            target: str_field("target")?,
            separator: str_field("separator")?,
        },
        "format_date" => Op::FormatDate {
            source: str_field("source")?,
            target: opt_str("target"),
            date_format: str_field("date_format")?,
        },
        "parse_date" => Op::ParseDate {
            source: str_field("source")?,
            target: opt_str("target"),
            date_format: str_field("date_format")?,
        },
        other => return Err(EngineError::Config(format!("unknown transform op type '{other}'"))),
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn substitute(expression: &str, record: &Record) -> String {
    let mut out = String::with_capacity(expression.len());
    let bytes = expression.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if expression[i..].starts_with("${") {
            if let Some(end) = expression[i + 2..].find('}') {
                let name = &expression[i + 2..i + 2 + end];
                let value = record.get(name).map(stringify).unwrap_or_default();
                out.push_str(&value);
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = expression[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn cast_value(value: &Value, to_type: FieldType) -> Result<Value> {
    match to_type {
        FieldType::String => Ok(json!(stringify(value))),
        FieldType::Number => match value {
            Value::Number(n) => Ok(json!(n.clone())),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|n| json!(n))
                .map_err(|_| EngineError::Type(format!("cannot cast '{s}' to number"))),
            Value::Bool(b) => Ok(json!(if *b { 1 } else { 0 })),
            other => Err(EngineError::Type(format!("cannot cast {other} to number"))),
        },
        FieldType::Boolean => match value {
            Value::Bool(b) => Ok(json!(*b)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(json!(true)),
                "false" | "0" | "no" => Ok(json!(false)),
                _ => Err(EngineError::Type(format!("cannot cast '{s}' to boolean"))),
            },
            Value::Number(n) => Ok(json!(n.as_f64().unwrap_or(0.0) != 0.0)),
            other => Err(EngineError::Type(format!("cannot cast {other} to boolean"))),
        },
        FieldType::Date => match value {
            Value::String(s) => parse_any_date(s)
                .map(|dt| json!(dt.to_rfc3339()))
                .ok_or_else(|| EngineError::Type(format!("cannot cast '{s}' to date"))),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(|dt| json!(dt.to_rfc3339()))
                .ok_or_else(|| EngineError::Type(format!("cannot cast {n} to date"))),
            other => Err(EngineError::Type(format!("cannot cast {other} to date"))),
        },
        FieldType::Json => Ok(value.clone()),
    }
}

fn parse_any_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive_formats = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    for fmt in naive_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

fn apply_op(op: &Op, record: &mut Record) -> Result<()> {
    match op {
        Op::Rename { source, target } => {
            if let Some(value) = record.remove(source) {
                record.insert(target.clone(), value);
            }
        }
        Op::Delete { source } => {
            record.remove(source);
        }
        Op::Add { target, value, expression } => {
            let resolved = if let Some(expr) = expression {
                json!(substitute(expr, record))
            } else {
                value.clone().unwrap_or_else(|| json!(""))
            };
            record.insert(target.clone(), resolved);
        }
        Op::Modify { source, value, expression } => {
            let resolved = if let Some(expr) = expression {
                json!(substitute(expr, record))
            } else {
                value.clone().unwrap_or(Value::Null)
            };
            record.insert(source.clone(), resolved);
        }
        Op::Cast { source, target, to_type } => {
            if let Some(current) = record.get(source).cloned() {
                let cast = cast_value(&current, *to_type)?;
                record.insert(target.clone().unwrap_or_else(|| source.clone()), cast);
            }
        }
        Op::Copy { source, target } => {
            if let Some(value) = record.get(source).cloned() {
                record.insert(target.clone(), value);
            }
        }
        Op::Lowercase { source } => {
            if let Some(Value::String(s)) = record.get(source) {
                let lowered = s.to_lowercase();
                record.insert(source.clone(), json!(lowered));
            }
        }
        Op::Uppercase { source } => {
            if let Some(Value::String(s)) = record.get(source) {
                let uppered = s.to_uppercase();
                record.insert(source.clone(), json!(uppered));
            }
        }
        Op::Trim { source } => {
            if let Some(Value::String(s)) = record.get(source) {
                let trimmed = s.trim().to_string();
                record.insert(source.clone(), json!(trimmed));
            }
        }
        Op::Replace { source, old_value, new_value } => {
            if let Some(Value::String(s)) = record.get(source) {
                let replaced = s.replace(old_value.as_str(), new_value);
                record.insert(source.clone(), json!(replaced));
            }
        }
        Op::Concat { sources, target, separator } => {
            let joined = sources
                .iter()
                .map(|s| record.get(s).map(stringify).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(separator);
            record.insert(target.clone(), json!(joined));
        }
        Op::Split { source, target, separator } => {
            if let Some(Value::String(s)) = record.get(source) {
                let parts: Vec<Value> = s.split(separator.as_str()).map(|p| json!(p)).collect();
                record.insert(target.clone(), Value::Array(parts));
            }
        }
        Op::FormatDate { source, target, date_format } => {
            if let Some(value) = record.get(source) {
                let parsed = match value {
                    Value::String(s) => parse_any_date(s),
                    Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                    _ => None,
                };
                let dt = parsed.ok_or_else(|| EngineError::Type(format!("format_date: cannot parse value of '{source}'")))?;
                let formatted = dt.format(date_format).to_string();
                record.insert(target.clone().unwrap_or_else(|| source.clone()), json!(formatted));
            }
        }
        Op::ParseDate { source, target, date_format } => {
            if let Some(Value::String(s)) = record.get(source) {
                let naive = NaiveDateTime::parse_from_str(s, date_format)
                    .map(|n| Utc.from_utc_datetime(&n))
                    .or_else(|_| NaiveDate::parse_from_str(s, date_format).map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))))
                    .map_err(|_| EngineError::Type(format!("parse_date: '{s}' does not match '{date_format}'")))?;
                record.insert(target.clone().unwrap_or_else(|| source.clone()), json!(naive.to_rfc3339()));
            }
        }
    }
    Ok(())
}

fn evolve_schema(schema: &mut DataSchema, op: &Op) {
    match op {
        Op::Rename { source, target } => {
            if let Some(field) = schema.fields.iter_mut().find(|f| &f.name == source) {
                field.name = target.clone();
            }
        }
        Op::Delete { source } => {
            schema.fields.retain(|f| &f.name != source);
        }
        Op::Add { target, .. } => {
            if schema.field(target).is_none() {
                let mut field = FieldDefinition::new(target.clone(), FieldType::String, "");
                field.nullable = true;
                schema.fields.push(field);
            }
        }
        Op::Cast { source, target, to_type } => {
            let name = target.clone().unwrap_or_else(|| source.clone());
            if let Some(field) = schema.fields.iter_mut().find(|f| f.name == name) {
                field.field_type = *to_type;
            } else if let Some(origin) = schema.field(source).cloned() {
                schema.fields.push(FieldDefinition { name, field_type: *to_type, ..origin });
            }
        }
        Op::Copy { source, target } => {
            if let Some(origin) = schema.field(source).cloned() {
                schema.fields.push(FieldDefinition { name: target.clone(), ..origin });
            }
        }
        _ => {}
    }
}

#[derive(Default)]
pub struct FieldTransform {
    node_id: String,
    ops: Vec<Op>,
}

impl FieldTransform {
    fn apply_to_schema(&self, input_schema: &DataSchema) -> DataSchema {
        let mut schema = input_schema.clone();
        for op in &self.ops {
            evolve_schema(&mut schema, op);
        }
        schema
    }
}

#[async_trait]
impl Connector for FieldTransform {
    fn id(&self) -> &'static str {
        "field_transform"
    }

    fn name(&self) -> &'static str {
        "Field Transform"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Processor
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "transformations": {"type": "array"},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.node_id = node_id_of(config);
        self.ops = match config.get("transformations") {
            Some(Value::Array(items)) => items.iter().map(parse_op).collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(EngineError::Config("'transformations' must be an array".to_string())),
            None => Vec::new(),
        };
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        Ok(self.apply_to_schema(input_schema.unwrap_or(&DataSchema::empty())))
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let mut output_records = Vec::with_capacity(input.data.len());
        let mut errors = 0usize;
        let mut error_samples = Vec::new();

        for record in input.data {
            ctx.check()?;
            let mut working = record;
            let mut failed = false;
            for op in &self.ops {
                if let Err(e) = apply_op(op, &mut working) {
                    errors += 1;
                    if error_samples.len() < 10 {
                        error_samples.push(json!(e.to_string()));
                    }
                    failed = true;
                    break;
                }
            }
            if !failed {
                output_records.push(working);
            }
        }

        if output_records.is_empty() && errors > 0 {
            return Err(EngineError::Type(format!("field_transform: every record failed ({errors} error(s))")));
        }

        let schema = if input.metadata.schema.is_inferred_at_runtime() {
            crate::envelope::infer_schema(&output_records, Some(&self.node_id))
        } else {
            self.apply_to_schema(&input.metadata.schema)
        };

        let mut custom = Map::new();
        if errors > 0 {
            custom.insert("errors".to_string(), json!(errors));
            custom.insert("error_samples".to_string(), Value::Array(error_samples));
        }

        Ok(DataEnvelope {
            data: output_records.clone(),
            metadata: Metadata {
                node_id: self.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: output_records.len(),
                schema,
                sources: input.metadata.sources,
                custom,
                ..Metadata::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> RunContext {
        RunContext::new(None, Duration::from_secs(30), Arc::new(EngineConfig::default()))
    }

    fn rec(pairs: &[(&str, Value)]) -> Record {
        let mut m = Record::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        m
    }

    #[tokio::test]
    async fn rename_cast_add_pipeline_matches_scenario() {
        let mut transform = FieldTransform::default();
        transform
            .configure(&json!({
                "__node_id": "t1",
                "transformations": [
                    {"type": "rename", "source": "a", "target": "value"},
                    {"type": "cast", "source": "value", "to_type": "number"},
                    {"type": "add", "target": "status", "value": "ok"},
                ],
            }))
            .unwrap();

        let input_schema = DataSchema {
            fields: vec![
                FieldDefinition::new("a", FieldType::String, "src"),
                FieldDefinition::new("b", FieldType::String, "src"),
            ],
            source_nodes: vec!["src".to_string()],
        };
        let input = DataEnvelope {
            data: vec![rec(&[("a", json!("10")), ("b", json!("x"))])],
            metadata: Metadata { schema: input_schema.clone(), ..Metadata::default() },
        };

        let output = transform.execute(&ctx(), input).await.unwrap();
        assert_eq!(output.data[0].get("value").unwrap(), &json!(10.0));
        assert_eq!(output.data[0].get("status").unwrap(), &json!("ok"));
        assert!(!output.data[0].contains_key("a"));

        let schema = transform.get_output_schema(Some(&input_schema)).unwrap();
        assert_eq!(schema.field("value").unwrap().field_type, FieldType::Number);
        assert_eq!(schema.field("value").unwrap().source_node, "src");
        assert!(schema.field("status").unwrap().nullable);
        assert!(schema.field("a").is_none());
    }

    #[tokio::test]
    async fn non_convertible_cast_fails_only_that_record() {
        let mut transform = FieldTransform::default();
        transform
            .configure(&json!({
                "__node_id": "t1",
                "transformations": [{"type": "cast", "source": "a", "to_type": "number"}],
            }))
            .unwrap();
        let input = DataEnvelope {
            data: vec![rec(&[("a", json!("10"))]), rec(&[("a", json!("not a number"))])],
            metadata: Metadata::default(),
        };
        let output = transform.execute(&ctx(), input).await.unwrap();
        assert_eq!(output.data.len(), 1);
        assert_eq!(output.metadata.custom.get("errors").unwrap(), &json!(1));
    }

    #[test]
    fn substitution_ignores_arithmetic() {
        let record = rec(&[("x", json!(3))]);
        assert_eq!(substitute("${x}+1", &record), "3+1");
    }
}
