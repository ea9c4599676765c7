//! meshflow: a workflow execution engine for data integration pipelines.
//!
//! A workflow is a DAG of connector nodes (sources, processors,
//! destinations) described by [`graph::WorkflowGraph`]. [`engine::ExecutionEngine`]
//! validates a graph against a [`connector::ConnectorRegistry`] and then
//! runs it to completion, a cancellation, or a [`error::EngineError::NodeFailure`].

pub mod config;
pub mod connector;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod schema_merge;
pub mod value;

pub use config::EngineConfig;
pub use connector::{register_builtin_connectors, Connector, ConnectorKind, ConnectorRegistry, RunContext};
pub use engine::{ExecutionEngine, RunOutcome, RunResult};
pub use envelope::{DataEnvelope, DataSchema, FieldDefinition, FieldType, Metadata};
pub use error::{EngineError, Result};
pub use graph::{Edge, Node, WorkflowGraph};
pub use value::Record;
