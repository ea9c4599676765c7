//! Tabular-file (CSV-like) source and destination.
//!
//! Built on the `csv` crate's usual "open a delimited file, emit records"
//! shape, and on the engine's own path-resolution rules in `EngineConfig`.

use crate::config::EngineConfig;
use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{DataEnvelope, DataSchema, FieldDefinition, FieldType, Metadata};
use crate::error::{EngineError, Result};
use crate::value::Record;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

fn single_char(config: &Value, key: &str, default: char) -> char {
    config
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.chars().next())
        .unwrap_or(default)
}

#[derive(Clone)]
struct SourceState {
    file_path: String,
    has_header: bool,
    delimiter: u8,
    comment: Option<u8>,
    node_id: String,
}

#[derive(Default)]
pub struct TabularFileSource {
    state: Option<SourceState>,
}

impl TabularFileSource {
    fn state(&self) -> Result<&SourceState> {
        self.state
            .as_ref()
            .ok_or_else(|| EngineError::Config("tabular_file_source: not configured".to_string()))
    }

    fn resolved_path(&self) -> Result<PathBuf> {
        let state = self.state()?;
        Ok(EngineConfig::default().resolve_source_path(&state.file_path))
    }

    fn read(&self) -> Result<(Vec<String>, Vec<Record>)> {
        let state = self.state()?;
        let path = self.resolved_path()?;
        let mut builder = csv::ReaderBuilder::new();
        builder.delimiter(state.delimiter).has_headers(state.has_header);
        if let Some(comment) = state.comment {
            builder.comment(Some(comment));
        }
        let mut reader = builder
            .from_path(&path)
            .map_err(|e| EngineError::SourceIO(format!("cannot open '{}': {e}", path.display())))?;

        let headers: Vec<String> = if state.has_header {
            reader
                .headers()
                .map_err(|e| EngineError::Decode(e.to_string()))?
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };

        let mut records = Vec::new();
        let mut inferred_headers = headers.clone();
        for row in reader.records() {
            let row = row.map_err(|e| EngineError::Decode(e.to_string()))?;
            if inferred_headers.is_empty() {
                inferred_headers = (1..=row.len()).map(|i| format!("column_{i}")).collect();
            }
            let mut record = Record::new();
            for (i, value) in row.iter().enumerate() {
                let name = inferred_headers.get(i).cloned().unwrap_or_else(|| format!("column_{}", i + 1));
                record.insert(name, json!(value));
            }
            records.push(record);
        }

        Ok((inferred_headers, records))
    }
}

#[async_trait]
impl Connector for TabularFileSource {
    fn id(&self) -> &'static str {
        "tabular_file_source"
    }

    fn name(&self) -> &'static str {
        "Tabular File Source"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Source
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {"type": "string", "title": "File path"},
                "has_header": {"type": "boolean", "default": true},
                "delimiter": {"type": "string", "default": ","},
                "comment": {"type": "string", "description": "Single comment character"},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let file_path = config
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("tabular_file_source requires 'file_path'".to_string()))?
            .to_string();
        self.state = Some(SourceState {
            file_path,
            has_header: config.get("has_header").and_then(Value::as_bool).unwrap_or(true),
            delimiter: single_char(config, "delimiter", ',') as u8,
            comment: config.get("comment").and_then(Value::as_str).and_then(|s| s.chars().next()).map(|c| c as u8),
            node_id: node_id_of(config),
        });
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        let state = self.state()?;
        let (headers, _) = self.read()?;
        let fields = headers
            .into_iter()
            .map(|name| {
                let mut field = FieldDefinition::new(name, FieldType::String, state.node_id.clone());
                field.nullable = true;
                field
            })
            .collect();
        let mut schema = DataSchema { fields, source_nodes: Vec::new() };
        schema.push_source_node(&state.node_id);
        Ok(schema)
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, _input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let state = self.state()?;
        let path = self.resolved_path()?;
        let (_, records) = self.read()?;
        let schema = self.get_output_schema(None)?;

        let mut custom = Map::new();
        custom.insert("file_path".to_string(), json!(path.display().to_string()));

        Ok(DataEnvelope {
            data: records.clone(),
            metadata: Metadata {
                node_id: state.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: records.len(),
                execution_time_ms: 0,
                schema,
                sources: vec![state.node_id.clone()].into_iter().filter(|s| !s.is_empty()).collect(),
                custom,
            },
        })
    }
}

struct DestinationState {
    file_path: String,
    delimiter: u8,
    include_header: bool,
    append: bool,
    node_id: String,
}

#[derive(Default)]
pub struct TabularFileDestination {
    state: Option<DestinationState>,
}

impl TabularFileDestination {
    fn state(&self) -> Result<&DestinationState> {
        self.state
            .as_ref()
            .ok_or_else(|| EngineError::Config("tabular_file_destination: not configured".to_string()))
    }
}

#[async_trait]
impl Connector for TabularFileDestination {
    fn id(&self) -> &'static str {
        "tabular_file_destination"
    }

    fn name(&self) -> &'static str {
        "Tabular File Destination"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Destination
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {"type": "string"},
                "delimiter": {"type": "string", "default": ","},
                "include_header": {"type": "boolean", "default": true},
                "append": {"type": "boolean", "default": false},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let file_path = config
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("tabular_file_destination requires 'file_path'".to_string()))?
            .to_string();
        self.state = Some(DestinationState {
            file_path,
            delimiter: single_char(config, "delimiter", ',') as u8,
            include_header: config.get("include_header").and_then(Value::as_bool).unwrap_or(true),
            append: config.get("append").and_then(Value::as_bool).unwrap_or(false),
            node_id: node_id_of(config),
        });
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        Ok(DataSchema::empty())
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let state = self.state()?;

        if input.data.is_empty() {
            return Err(EngineError::DestinationIO("no data to write".to_string()));
        }

        let path = EngineConfig::default().resolve_destination_path(&state.file_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::DestinationIO(format!("cannot create '{}': {e}", parent.display())))?;
        }

        let header_order: Vec<String> = if !input.metadata.schema.fields.is_empty() {
            input.metadata.schema.fields.iter().map(|f| f.name.clone()).collect()
        } else {
            let mut seen = Vec::new();
            for record in &input.data {
                for key in record.keys() {
                    if !seen.iter().any(|k: &String| k == key) {
                        seen.push(key.clone());
                    }
                }
            }
            seen
        };

        let file_is_new = !state.append || !path.exists() || std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(state.append)
            .truncate(!state.append)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::DestinationIO(format!("cannot open '{}': {e}", path.display())))?;

        let mut writer = csv::WriterBuilder::new().delimiter(state.delimiter).has_headers(false).from_writer(file);

        if state.include_header && file_is_new {
            writer
                .write_record(&header_order)
                .map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        }

        for record in &input.data {
            let row: Vec<String> = header_order
                .iter()
                .map(|field| {
                    record
                        .get(field)
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            Value::Null => String::new(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default()
                })
                .collect();
            writer.write_record(&row).map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        }
        writer.flush().map_err(|e| EngineError::DestinationIO(e.to_string()))?;

        let mut custom = Map::new();
        custom.insert("file_path".to_string(), json!(path.display().to_string()));
        custom.insert("success".to_string(), json!(true));

        Ok(DataEnvelope {
            data: Vec::new(),
            metadata: Metadata {
                node_id: state.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: input.data.len(),
                schema: DataSchema::empty(),
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
    use tempfile::tempdir;

    fn ctx() -> RunContext {
        RunContext::new(None, std::time::Duration::from_secs(30), std::sync::Arc::new(EngineConfig::default()))
    }

    #[tokio::test]
    async fn csv_source_infers_string_schema_and_reads_rows() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        std::env::set_var("MESHFLOW_DATA_DIR", data_dir.to_str().unwrap());
        std::fs::write(data_dir.join("people.csv"), "name,age,email\nAlice,30,alice@x\nBob,25,bob@x\n").unwrap();

        let mut source = TabularFileSource::default();
        source
            .configure(&json!({"file_path": "people.csv", "has_header": true, "__node_id": "n1"}))
            .unwrap();

        let schema = source.get_output_schema(None).unwrap();
        let mut names: Vec<_> = schema.fields.iter().map(|f| f.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["age".to_string(), "email".to_string(), "name".to_string()]);
        assert!(schema.fields.iter().all(|f| f.field_type == FieldType::String && f.nullable));

        let envelope = source.execute(&ctx(), DataEnvelope::empty()).await.unwrap();
        assert_eq!(envelope.data.len(), 2);
        assert_eq!(envelope.metadata.node_type, "tabular_file_source");
        assert!(envelope.metadata.custom.contains_key("file_path"));

        std::env::remove_var("MESHFLOW_DATA_DIR");
    }

    #[tokio::test]
    async fn csv_destination_writes_header_and_rows() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        std::env::set_var("MESHFLOW_DATA_DIR", data_dir.to_str().unwrap());

        let mut destination = TabularFileDestination::default();
        destination.configure(&json!({"file_path": "out.csv", "__node_id": "n2"})).unwrap();

        let mut record = Record::new();
        record.insert("a".to_string(), json!("1"));
        record.insert("b".to_string(), json!("2"));
        let input = DataEnvelope {
            data: vec![record],
            metadata: Metadata {
                schema: DataSchema {
                    fields: vec![
                        FieldDefinition::new("a", FieldType::String, "n1"),
                        FieldDefinition::new("b", FieldType::String, "n1"),
                    ],
                    source_nodes: vec!["n1".to_string()],
                },
                sources: vec!["n1".to_string()],
                ..Metadata::default()
            },
        };

        let result = destination.execute(&ctx(), input).await.unwrap();
        assert_eq!(result.metadata.record_count, 1);
        assert!(result.data.is_empty());

        let written = std::fs::read_to_string(data_dir.join("storage/workflow_results/out.csv")).unwrap();
        assert_eq!(written, "a,b\n1,2\n");

        std::env::remove_var("MESHFLOW_DATA_DIR");
    }

    #[tokio::test]
    async fn csv_destination_empty_input_fails() {
        let mut destination = TabularFileDestination::default();
        destination.configure(&json!({"file_path": "out.csv", "__node_id": "n2"})).unwrap();
        let result = destination.execute(&ctx(), DataEnvelope::empty()).await;
        assert!(matches!(result, Err(EngineError::DestinationIO(_))));
    }
}
