//! Format-converter processor.
//!
//! The least opinionated connector: it neither originates nor discards data,
//! it only normalizes the envelope shape. Multiple incoming envelope shapes
//! (array-only, `records`-keyed, and canonical mappings) are all tolerated
//! elsewhere in the engine; this connector performs that normalization
//! explicitly rather than leaving it implicit at every call site.

use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{infer_schema, DataEnvelope, DataSchema, Metadata};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(Default)]
pub struct FormatConverter {
    node_id: String,
}

#[async_trait]
impl Connector for FormatConverter {
    fn id(&self) -> &'static str {
        "format_converter"
    }

    fn name(&self) -> &'static str {
        "Format Converter"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Processor
    }

    fn config_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.node_id = node_id_of(config);
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        Ok(input_schema.cloned().unwrap_or_else(DataSchema::empty))
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let schema = if input.metadata.schema.is_inferred_at_runtime() {
            infer_schema(&input.data, Some(&self.node_id))
        } else {
            input.metadata.schema.clone()
        };

        Ok(DataEnvelope {
            data: input.data.clone(),
            metadata: Metadata {
                node_id: self.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: input.data.len(),
                schema,
                sources: input.metadata.sources,
                custom: Default::default(),
                ..Metadata::default()
            },
        })
    }
}
