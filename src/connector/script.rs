//! Embedded-script (JavaScript) processor.
//!
//! A fresh interpreter per invocation: the input bound as a global, the
//! script body wrapped in an immediately-invoked function so a top-level
//! `return` works, evaluated, the result converted back to
//! `serde_json::Value`. A script that assigns `result` instead of returning
//! is also honored, since the wrapper checks for it right after the script's
//! own statements run. `boa_engine` needs no sandboxing step beyond that — a
//! fresh `Context` has no filesystem, network, process, or clock binding to
//! begin with (see DESIGN.md, Open Question resolution #4).

use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{infer_schema, DataEnvelope, DataSchema, Metadata};
use crate::error::{EngineError, Result};
use crate::value::Record;
use async_trait::async_trait;
use boa_engine::{Context, Source};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    PerRecord,
    Batch,
}

#[derive(Default)]
pub struct ScriptProcessor {
    node_id: String,
    script: String,
    mode: Mode,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::PerRecord
    }
}

fn eval_js(full_source: &str) -> std::result::Result<String, String> {
    let mut context = Context::default();
    let value = context.eval(Source::from_bytes(full_source)).map_err(|e| e.to_string())?;
    let js_string = value.to_string(&mut context).map_err(|e| e.to_string())?;
    Ok(js_string.to_std_string_escaped())
}

fn run_per_record(script: &str, record: &Record) -> Result<Record> {
    let input_json = serde_json::to_string(&Value::Object(record.clone()))
        .map_err(|e| EngineError::Script(format!("cannot serialize record: {e}")))?;
    let full_source = format!(
        "var record = {input_json};\nvar __r = (function() {{\n{script}\n;return (typeof result !== 'undefined') ? result : undefined;\n}})();\nJSON.stringify((__r !== undefined) ? __r : record);"
    );
    let output_json = eval_js(&full_source).map_err(EngineError::Script)?;
    let value: Value = serde_json::from_str(&output_json)
        .map_err(|e| EngineError::Script(format!("script output is not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(EngineError::Type(format!("per_record script must return a record, got {other}"))),
    }
}

fn run_batch(script: &str, records: &[Record]) -> Result<Vec<Record>> {
    let input_json = serde_json::to_string(&Value::Array(records.iter().map(|r| Value::Object(r.clone())).collect()))
        .map_err(|e| EngineError::Script(format!("cannot serialize records: {e}")))?;
    let full_source = format!(
        "var records = {input_json};\nvar __r = (function() {{\n{script}\n;return (typeof result !== 'undefined') ? result : undefined;\n}})();\nJSON.stringify((__r !== undefined) ? __r : records);"
    );
    let output_json = eval_js(&full_source).map_err(EngineError::Script)?;
    let value: Value = serde_json::from_str(&output_json)
        .map_err(|e| EngineError::Script(format!("script output is not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(EngineError::Type(format!("batch script must return records, got {other}"))),
            })
            .collect(),
        other => Err(EngineError::Type(format!("batch script must return a record or a sequence, got {other}"))),
    }
}

#[async_trait]
impl Connector for ScriptProcessor {
    fn id(&self) -> &'static str {
        "script_processor"
    }

    fn name(&self) -> &'static str {
        "Script Processor"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Processor
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["script"],
            "properties": {
                "script": {"type": "string"},
                "language": {"type": "string", "enum": ["javascript"], "default": "javascript"},
                "mode": {"type": "string", "enum": ["per_record", "batch"], "default": "per_record"},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.node_id = node_id_of(config);
        self.script = config
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("script_processor requires 'script'".to_string()))?
            .to_string();
        let language = config.get("language").and_then(Value::as_str).unwrap_or("javascript");
        if language != "javascript" {
            return Err(EngineError::Config(format!("unsupported script language '{language}'")));
        }
        self.mode = match config.get("mode").and_then(Value::as_str).unwrap_or("per_record") {
            "per_record" => Mode::PerRecord,
            "batch" => Mode::Batch,
            other => return Err(EngineError::Config(format!("unknown script mode '{other}'"))),
        };
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

        let output_records = match self.mode {
            Mode::PerRecord => {
                let mut records = Vec::with_capacity(input.data.len());
                for record in &input.data {
                    ctx.check()?;
                    records.push(run_per_record(&self.script, record)?);
                }
                records
            }
            Mode::Batch => run_batch(&self.script, &input.data)?,
        };

        let mut schema = infer_schema(&output_records, None);
        schema.source_nodes = input.metadata.schema.source_nodes.clone();

        let mut custom = Map::new();
        custom.insert(
            "mode".to_string(),
            json!(match self.mode {
                Mode::PerRecord => "per_record",
                Mode::Batch => "batch",
            }),
        );
        custom.insert("script_preview".to_string(), json!(self.script.chars().take(100).collect::<String>()));

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
