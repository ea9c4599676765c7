//! Graph execution engine: validates a workflow graph, then runs it.
//!
//! Builds a `petgraph` DAG, topologically sorts it, and walks it node by
//! node under one `tracing` span per run, logging a line per node with
//! id/type/record count/elapsed time. The whole graph — connector
//! existence, config, and schema compatibility — is validated *before*
//! running anything, and inputs from multiple predecessors are merged
//! rather than a node always receiving a single predecessor's context
//! verbatim.

use crate::connector::{Connector, ConnectorKind, ConnectorRegistry, RunContext};
use crate::envelope::{DataEnvelope, DataSchema};
use crate::error::{EngineError, Result};
use crate::graph::WorkflowGraph;
use crate::schema_merge::{merge_envelopes, merge_schemas, NodeLabels};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Stamp the engine-owned `__node_id` key into a copy of a node's config
/// before handing it to `configure` (see DESIGN.md, Open Question
/// resolution #5).
fn config_with_node_id(config: &Value, node_id: &str) -> Value {
    let mut map = match config {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("__node_id".to_string(), Value::String(node_id.to_string()));
    Value::Object(map)
}

struct PreparedNode {
    connector_type_id: String,
    connector: Box<dyn Connector>,
}

/// The result of pre-execution validation: every node instantiated,
/// configured, and schema-checked, ready to run in `order`.
pub struct ValidatedWorkflow {
    graph: WorkflowGraph,
    order: Vec<String>,
    nodes: HashMap<String, PreparedNode>,
    pub output_schemas: HashMap<String, DataSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub struct RunResult {
    pub results: HashMap<String, DataEnvelope>,
    pub outcome: RunOutcome,
    pub error: Option<EngineError>,
}

/// Validates and runs workflow graphs against a fixed connector registry.
/// Stateless beyond the registry reference; every run gets its own
/// `ValidatedWorkflow` and its own connector instances.
pub struct ExecutionEngine<'a> {
    registry: &'a ConnectorRegistry,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(registry: &'a ConnectorRegistry) -> Self {
        Self { registry }
    }

    /// Pre-execution validation: edge existence, cycle detection, per-node
    /// instantiate + configure + schema check, and the source/destination
    /// positional rule — all before any `execute` runs.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<ValidatedWorkflow> {
        let order = graph.execution_order()?;
        let node_labels = graph.node_labels();

        let mut nodes: HashMap<String, PreparedNode> = HashMap::new();
        let mut output_schemas: HashMap<String, DataSchema> = HashMap::new();

        for node_id in &order {
            let node = graph
                .node(node_id)
                .expect("execution_order only returns ids present in the graph");

            let mut connector = self.registry.get(&node.connector_type_id)?;
            let predecessors = graph.predecessors(node_id);
            let has_successors = graph.edges.iter().any(|e| e.source == *node_id);

            if connector.kind() == ConnectorKind::Source && !predecessors.is_empty() {
                return Err(EngineError::InvalidGraph(format!(
                    "source node '{node_id}' must not have predecessors"
                )));
            }
            if connector.kind() == ConnectorKind::Destination && has_successors {
                return Err(EngineError::InvalidGraph(format!(
                    "destination node '{node_id}' must not have successors"
                )));
            }

            let config = config_with_node_id(&node.config, node_id);
            connector.configure(&config)?;

            let input_schema = if predecessors.is_empty() {
                None
            } else {
                let predecessor_schemas: Vec<DataSchema> = predecessors
                    .iter()
                    .map(|p| {
                        output_schemas
                            .get(*p)
                            .cloned()
                            .expect("predecessors appear earlier in topological order")
                    })
                    .collect();
                Some(merge_schemas(&predecessor_schemas, &node_labels))
            };

            connector.validate_input_schema(input_schema.as_ref())?;
            let output_schema = connector.get_output_schema(input_schema.as_ref())?;
            output_schemas.insert(node_id.clone(), output_schema);

            nodes.insert(
                node_id.clone(),
                PreparedNode { connector_type_id: node.connector_type_id.clone(), connector },
            );
        }

        Ok(ValidatedWorkflow { graph: graph.clone(), order, nodes, output_schemas })
    }

    /// Validate then execute. Validation failures short-circuit with
    /// `RunOutcome::Failed` and never invoke a single connector's `execute`.
    pub async fn run(&self, graph: &WorkflowGraph, ctx: &RunContext) -> RunResult {
        let validated = match self.validate(graph) {
            Ok(v) => v,
            Err(e) => {
                return RunResult { results: HashMap::new(), outcome: RunOutcome::Failed, error: Some(e) };
            }
        };
        self.execute(validated, ctx).await
    }

    /// Walk `validated.order`, aggregating each node's input from its
    /// predecessors' stored results and invoking `execute` under the run's
    /// deadline. Stops and reports `Cancelled`/`Failed` at the first node
    /// that can't proceed; never starts a node after that point.
    async fn execute(&self, validated: ValidatedWorkflow, ctx: &RunContext) -> RunResult {
        let node_labels = validated.graph.node_labels();
        let mut results: HashMap<String, DataEnvelope> = HashMap::new();

        for node_id in &validated.order {
            if let Err(e) = ctx.check() {
                tracing::warn!(node_id = %node_id, "run cancelled before node started");
                return RunResult { results, outcome: RunOutcome::Cancelled, error: Some(e) };
            }

            let mut predecessors: Vec<&str> = validated.graph.predecessors(node_id);
            predecessors.sort_unstable();

            let input = match predecessors.len() {
                0 => DataEnvelope::empty(),
                1 => results
                    .get(predecessors[0])
                    .cloned()
                    .expect("topological order guarantees predecessor already ran"),
                _ => {
                    let envelopes: Vec<DataEnvelope> = predecessors
                        .iter()
                        .map(|p| {
                            results
                                .get(*p)
                                .cloned()
                                .expect("topological order guarantees predecessor already ran")
                        })
                        .collect();
                    merge_envelopes(&envelopes, &node_labels)
                }
            };

            let prepared = validated
                .nodes
                .get(node_id)
                .expect("every node in execution order was prepared during validation");

            let started = Instant::now();
            let outcome = prepared.connector.execute(ctx, input).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(mut envelope) => {
                    envelope.metadata.execution_time_ms = elapsed_ms;
                    tracing::info!(
                        node_id = %node_id,
                        connector_type_id = %prepared.connector_type_id,
                        record_count = envelope.data.len(),
                        elapsed_ms,
                        "node completed"
                    );
                    results.insert(node_id.clone(), envelope);
                }
                Err(EngineError::Cancelled) => {
                    tracing::warn!(node_id = %node_id, elapsed_ms, "run cancelled mid-node");
                    return RunResult { results, outcome: RunOutcome::Cancelled, error: Some(EngineError::Cancelled) };
                }
                Err(cause) => {
                    let failure = cause.into_node_failure(node_id.clone(), prepared.connector_type_id.clone());
                    tracing::error!(node_id = %node_id, elapsed_ms, error = %failure, "node failed");
                    return RunResult { results, outcome: RunOutcome::Failed, error: Some(failure) };
                }
            }
        }

        RunResult { results, outcome: RunOutcome::Completed, error: None }
    }
}
