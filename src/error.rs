//! Error taxonomy for the engine.
//!
//! Connectors and the graph engine share one closed set of error kinds.
//! Local recovery (retries, per-record/per-batch error accumulation) is
//! handled inside the connectors that declare it; everything else surfaces
//! here unchanged and is wrapped in `NodeFailure` once the engine attributes
//! it to a node.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("cyclic graph")]
    CyclicGraph,

    #[error("unknown connector type: {0}")]
    UnknownConnector(String),

    #[error("source io error: {0}")]
    SourceIO(String),

    #[error("destination io error: {0}")]
    DestinationIO(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("node '{node_id}' ({connector_type_id}) failed: {cause}")]
    NodeFailure {
        node_id: String,
        connector_type_id: String,
        cause: Box<EngineError>,
        error_stack: Option<String>,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Attribute an error to a node, wrapping it as the engine does at the
    /// boundary between a connector's `execute` and the run's outcome.
    pub fn into_node_failure(self, node_id: impl Into<String>, connector_type_id: impl Into<String>) -> EngineError {
        let stack = format!("{self:?}");
        EngineError::NodeFailure {
            node_id: node_id.into(),
            connector_type_id: connector_type_id.into(),
            cause: Box::new(self),
            error_stack: Some(stack),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
