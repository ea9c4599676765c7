//! The connector contract and registry.
//!
//! An open registry keyed by connector type id, rather than a closed enum
//! over node kinds — every connector implementation lives in its own module
//! under `connector::` and registers a zero-arg factory once at startup
//! against a shared trait interface.

pub mod csv_file;
pub mod http;
pub mod passthrough;
pub mod record_store;
pub mod script;
pub mod transform;

use crate::config::EngineConfig;
use crate::envelope::{DataEnvelope, DataSchema};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// The three connector categories a workflow node can take on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Source,
    Processor,
    Destination,
}

/// Everything a connector's `execute` needs about the run it belongs to:
/// identity, a deadline, a cooperative cancellation signal, and a span to log
/// under. Built once per run at the composition root and shared by
/// reference across every node.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub user_id: Option<String>,
    pub engine_config: Arc<EngineConfig>,
    started_at: Instant,
    max_duration: Duration,
    cancellation: CancellationToken,
    pub span: Span,
}

impl RunContext {
    pub fn new(user_id: Option<String>, max_duration: Duration, engine_config: Arc<EngineConfig>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            user_id,
            engine_config,
            started_at: Instant::now(),
            max_duration,
            cancellation: CancellationToken::new(),
            span: tracing::info_span!("run"),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_past_deadline(&self) -> bool {
        self.started_at.elapsed() >= self.max_duration
    }

    pub fn time_remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.started_at.elapsed())
    }

    /// Cooperative checkpoint: connectors call this at I/O and batch
    /// boundaries and propagate the error immediately if it returns one.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() || self.is_past_deadline() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The uniform interface every connector implements. The registry hands out
/// a fresh, unconfigured instance per node; `configure` validates and stores
/// the node's static config before `get_output_schema`/`validate_input_schema`
/// /`execute` are called against it.
#[async_trait]
pub trait Connector: Send {
    /// Stable type id used in workflow node definitions and the registry key
    /// (e.g. `"tabular_file_source"`).
    fn id(&self) -> &'static str;

    /// Human-readable name for diagnostics and CLI listings.
    fn name(&self) -> &'static str;

    fn kind(&self) -> ConnectorKind;

    /// A JSON schema document describing valid node `config` values,
    /// consumed by an external editor — not produced or validated against by
    /// the engine itself.
    fn config_schema(&self) -> Value {
        json!({})
    }

    /// Validate and store this node's config. Idempotent: calling it twice
    /// with the same config must leave the connector in the same state.
    fn configure(&mut self, config: &Value) -> Result<()>;

    /// Compute this node's declared output schema from its (already stored)
    /// config and its input schema. `None` means "no predecessors" (source
    /// position). Connectors whose shape depends on data only available at
    /// execution time return `DataSchema::empty()` ("inferred at runtime").
    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema>;

    /// Reject an input position this connector's kind cannot occupy: a
    /// source must see `None`, a destination must see `Some` non-empty.
    /// Processors accept anything by default.
    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        let _ = input_schema;
        Ok(())
    }

    async fn execute(&self, ctx: &RunContext, input: DataEnvelope) -> Result<DataEnvelope>;
}

/// Every connector's `configure` reads the engine-injected `__node_id` entry
/// to learn its own node id for stamping provenance on fields it originates.
pub(crate) fn node_id_of(config: &Value) -> String {
    config.get("__node_id").and_then(Value::as_str).unwrap_or("").to_string()
}

/// Rejects any source given a predecessor, or any destination/processor
/// given none — the baseline `validate_input_schema` rule every connector
/// starts from. Individual connectors call this from their own
/// `validate_input_schema`.
pub fn validate_input_position(kind: ConnectorKind, input_schema: Option<&DataSchema>) -> Result<()> {
    match (kind, input_schema) {
        (ConnectorKind::Source, Some(_)) => Err(EngineError::Schema(
            "source connectors do not accept an input schema".to_string(),
        )),
        (ConnectorKind::Destination, None) => Err(EngineError::Schema(
            "destination connectors require a non-empty input schema".to_string(),
        )),
        _ => Ok(()),
    }
}

type ConnectorFactory = fn() -> Box<dyn Connector>;

/// Type-id-keyed map from connector type id to a zero-arg factory, populated
/// exactly once at startup and read-only afterward: the set of available
/// connector *types* never changes at runtime, unlike workflow *definitions*
/// built from them.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<&'static str, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &'static str, factory: ConnectorFactory) {
        self.factories.insert(id, factory);
    }

    /// Construct a fresh, unconfigured connector instance for `type_id`.
    pub fn get(&self, type_id: &str) -> Result<Box<dyn Connector>> {
        let factory = self
            .factories
            .get(type_id)
            .ok_or_else(|| EngineError::UnknownConnector(type_id.to_string()))?;
        Ok(factory())
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn list(&self) -> Vec<(&'static str, &'static str, ConnectorKind)> {
        let mut entries: Vec<_> = self
            .factories
            .values()
            .map(|factory| {
                let instance = factory();
                (instance.id(), instance.name(), instance.kind())
            })
            .collect();
        entries.sort_by_key(|(id, _, _)| *id);
        entries
    }
}

/// Build a registry carrying every connector this crate ships.
pub fn register_builtin_connectors() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register("tabular_file_source", || Box::new(csv_file::TabularFileSource::default()));
    registry.register("tabular_file_destination", || Box::new(csv_file::TabularFileDestination::default()));
    registry.register("http_source", || Box::new(http::HttpSource::default()));
    registry.register("http_destination", || Box::new(http::HttpDestination::default()));
    registry.register("record_store_source", || Box::new(record_store::RecordStoreSource::default()));
    registry.register("record_store_destination", || Box::new(record_store::RecordStoreDestination::default()));
    registry.register("format_converter", || Box::new(passthrough::FormatConverter::default()));
    registry.register("field_transform", || Box::new(transform::FieldTransform::default()));
    registry.register("script_processor", || Box::new(script::ScriptProcessor::default()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_every_connector_id() {
        let registry = register_builtin_connectors();
        assert_eq!(
            registry.ids(),
            vec![
                "field_transform",
                "format_converter",
                "http_destination",
                "http_source",
                "record_store_destination",
                "record_store_source",
                "script_processor",
                "tabular_file_destination",
                "tabular_file_source",
            ]
        );
    }

    #[test]
    fn unknown_connector_id_is_rejected() {
        let registry = register_builtin_connectors();
        assert!(matches!(registry.get("does_not_exist"), Err(EngineError::UnknownConnector(_))));
    }

    #[test]
    fn get_returns_a_fresh_instance_each_call() {
        let registry = register_builtin_connectors();
        let mut a = registry.get("tabular_file_source").unwrap();
        let b = registry.get("tabular_file_source").unwrap();
        // Configuring one instance must not be observable through another.
        a.configure(&json!({"file_path": "uploads/a.csv"})).unwrap();
        assert!(b.get_output_schema(None).is_ok());
    }

    #[test]
    fn run_context_checkpoint_respects_cancellation() {
        let ctx = RunContext::new(None, Duration::from_secs(60), Arc::new(EngineConfig::default()));
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn run_context_checkpoint_respects_deadline() {
        let ctx = RunContext::new(None, Duration::from_millis(0), Arc::new(EngineConfig::default()));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(ctx.check(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn validate_input_position_rejects_source_with_input() {
        let schema = DataSchema::empty();
        assert!(validate_input_position(ConnectorKind::Source, Some(&schema)).is_err());
        assert!(validate_input_position(ConnectorKind::Source, None).is_ok());
    }

    #[test]
    fn validate_input_position_rejects_destination_without_input() {
        assert!(validate_input_position(ConnectorKind::Destination, None).is_err());
        let schema = DataSchema::empty();
        assert!(validate_input_position(ConnectorKind::Destination, Some(&schema)).is_ok());
    }
}
