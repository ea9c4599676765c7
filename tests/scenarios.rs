//! End-to-end scenarios from the engine's testable-properties set: a single
//! source inferring a schema, a multi-source merge with a name collision, a
//! field-transform pipeline, HTTP retry semantics, cyclic-graph rejection,
//! and a per-record script doubling values.

use meshflow::{register_builtin_connectors, EngineConfig, ExecutionEngine, RunContext, RunOutcome, WorkflowGraph};
use meshflow::{Edge, Node};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn ctx() -> RunContext {
    RunContext::new(None, Duration::from_secs(30), Arc::new(EngineConfig::default()))
}

fn node(id: &str, connector_type_id: &str, label: &str, config: serde_json::Value) -> Node {
    Node { id: id.to_string(), connector_type_id: connector_type_id.to_string(), label: label.to_string(), config }
}

fn edge(source: &str, target: &str) -> Edge {
    Edge { source: source.to_string(), target: target.to_string(), source_port: None, target_port: None }
}

#[tokio::test]
async fn scenario_1_single_source_csv_schema_inference() {
    let dir = tempdir().unwrap();
    std::env::set_var("MESHFLOW_DATA_DIR", dir.path().to_str().unwrap());
    std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
    std::fs::write(dir.path().join("uploads/people.csv"), "name,age,email\nAlice,30,alice@x\nBob,25,bob@x\n").unwrap();

    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);
    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![node("src", "tabular_file_source", "", json!({"has_header": true, "delimiter": ",", "file_path": "uploads/people.csv"}))],
        edges: vec![],
    };

    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Completed, "{:?}", result.error);
    let envelope = result.results.get("src").unwrap();
    assert_eq!(envelope.data.len(), 2);

    let mut field_names: Vec<_> = envelope.metadata.schema.fields.iter().map(|f| f.name.clone()).collect();
    field_names.sort();
    assert_eq!(field_names, vec!["age".to_string(), "email".to_string(), "name".to_string()]);
    for field in &envelope.metadata.schema.fields {
        assert_eq!(field.field_type, meshflow::FieldType::String);
        assert!(field.nullable);
    }
    assert!(envelope.metadata.custom.get("file_path").is_some());

    std::env::remove_var("MESHFLOW_DATA_DIR");
}

#[tokio::test]
async fn scenario_2_multi_source_merge_with_collision() {
    let dir = tempdir().unwrap();
    std::env::set_var("MESHFLOW_DATA_DIR", dir.path().to_str().unwrap());
    std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
    std::fs::write(dir.path().join("uploads/users.csv"), "id,name\nu1,Alice\nu2,Bob\n").unwrap();
    std::fs::write(dir.path().join("uploads/tasks.csv"), "id,title\nt1,T1\nt2,T2\n").unwrap();

    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);
    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![
            node("a", "tabular_file_source", "Users", json!({"file_path": "uploads/users.csv"})),
            node("b", "tabular_file_source", "Tasks", json!({"file_path": "uploads/tasks.csv"})),
            node("merged", "format_converter", "", json!({})),
        ],
        edges: vec![edge("a", "merged"), edge("b", "merged")],
    };

    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Completed, "{:?}", result.error);
    let merged = result.results.get("merged").unwrap();
    assert_eq!(merged.data.len(), 4);

    let field_names: std::collections::HashSet<_> = merged.metadata.schema.fields.iter().map(|f| f.name.clone()).collect();
    assert_eq!(
        field_names,
        std::collections::HashSet::from([
            "Users_id".to_string(),
            "name".to_string(),
            "Tasks_id".to_string(),
            "title".to_string(),
        ])
    );

    std::env::remove_var("MESHFLOW_DATA_DIR");
}

#[tokio::test]
async fn scenario_3_field_transform_rename_cast_add() {
    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);

    let dir = tempdir().unwrap();
    std::env::set_var("MESHFLOW_DATA_DIR", dir.path().to_str().unwrap());
    std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
    std::fs::write(dir.path().join("uploads/in.csv"), "a,b\n10,x\n").unwrap();

    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![
            node("src", "tabular_file_source", "", json!({"file_path": "uploads/in.csv"})),
            node(
                "xform",
                "field_transform",
                "",
                json!({
                    "transformations": [
                        {"type": "rename", "source": "a", "target": "value"},
                        {"type": "cast", "source": "value", "to_type": "number"},
                        {"type": "add", "target": "status", "value": "ok"},
                    ],
                }),
            ),
        ],
        edges: vec![edge("src", "xform")],
    };

    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Completed, "{:?}", result.error);
    let output = result.results.get("xform").unwrap();
    assert_eq!(output.data[0].get("value").unwrap(), &json!(10.0));
    assert_eq!(output.data[0].get("b").unwrap(), &json!("x"));
    assert_eq!(output.data[0].get("status").unwrap(), &json!("ok"));
    assert!(!output.data[0].contains_key("a"));

    assert_eq!(output.metadata.schema.field("value").unwrap().field_type, meshflow::FieldType::Number);
    assert!(output.metadata.schema.field("status").unwrap().nullable);

    std::env::remove_var("MESHFLOW_DATA_DIR");
}

#[tokio::test]
async fn scenario_4_http_destination_retry_semantics() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);
    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![
            node("src", "format_converter", "", json!({})),
            node(
                "dst",
                "http_destination",
                "",
                json!({
                    "url": format!("{}/ingest", server.uri()),
                    "retry_attempts": 2,
                    "retry_delay_ms": 10,
                }),
            ),
        ],
        edges: vec![edge("src", "dst")],
    };

    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Completed, "{:?}", result.error);
    let output = result.results.get("dst").unwrap();
    assert_eq!(output.metadata.custom.get("errors").unwrap(), &json!(0));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn scenario_5_cyclic_graph_rejection() {
    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);
    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![
            node("a", "field_transform", "", json!({})),
            node("b", "field_transform", "", json!({})),
            node("c", "field_transform", "", json!({})),
        ],
        edges: vec![edge("a", "b"), edge("b", "c"), edge("c", "a")],
    };
    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Failed);
    assert!(matches!(result.error, Some(meshflow::EngineError::CyclicGraph)));
    assert!(result.results.is_empty());
}

#[tokio::test]
async fn scenario_6_script_per_record_doubling() {
    let registry = register_builtin_connectors();
    let engine = ExecutionEngine::new(&registry);

    let dir = tempdir().unwrap();
    std::env::set_var("MESHFLOW_DATA_DIR", dir.path().to_str().unwrap());
    std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
    std::fs::write(dir.path().join("uploads/n.csv"), "n\n1\n2\n3\n").unwrap();

    let graph = WorkflowGraph {
        workflow_id: String::new(),
        nodes: vec![
            node("src", "tabular_file_source", "", json!({"file_path": "uploads/n.csv"})),
            node(
                "xform",
                "field_transform",
                "",
                json!({"transformations": [{"type": "cast", "source": "n", "to_type": "number"}]}),
            ),
            node(
                "script",
                "script_processor",
                "",
                json!({"script": "record.doubled = record.n * 2; return record;"}),
            ),
        ],
        edges: vec![edge("src", "xform"), edge("xform", "script")],
    };

    let result = engine.run(&graph, &ctx()).await;
    assert_eq!(result.outcome, RunOutcome::Completed, "{:?}", result.error);
    let output = result.results.get("script").unwrap();
    assert_eq!(output.data.len(), 3);
    assert_eq!(output.data[0].get("doubled").unwrap(), &json!(2.0));
    assert_eq!(output.data[1].get("doubled").unwrap(), &json!(4.0));
    assert_eq!(output.data[2].get("doubled").unwrap(), &json!(6.0));
    assert!(output.metadata.schema.field("n").is_some());
    assert!(output.metadata.schema.field("doubled").is_some());

    std::env::remove_var("MESHFLOW_DATA_DIR");
}
