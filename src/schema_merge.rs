//! Schema and envelope merging.
//!
//! Generalizes a single-predecessor hand-off — where a node simply overwrites
//! its context with its one predecessor's result — to an N-predecessor merge
//! with a deterministic name-collision policy.

use crate::envelope::{DataEnvelope, DataSchema, Metadata};
use crate::value::Record;
use std::collections::{HashMap, HashSet};

/// Map from node id to its human label, used to resolve collision prefixes.
pub type NodeLabels = HashMap<String, String>;

fn label_for(source_node: &str, node_labels: &NodeLabels) -> String {
    match node_labels.get(source_node) {
        Some(label) if !label.is_empty() => label.clone(),
        _ => source_node.to_string(),
    }
}

/// For every field name observed across `schemas`, collect the distinct
/// `source_node` values it appears under. A name is conflicting iff that set
/// has more than one member.
fn collision_sources(schemas: &[DataSchema]) -> HashMap<String, HashSet<String>> {
    let mut sources: HashMap<String, HashSet<String>> = HashMap::new();
    for schema in schemas {
        for field in &schema.fields {
            sources
                .entry(field.name.clone())
                .or_default()
                .insert(field.source_node.clone());
        }
    }
    sources
}

fn rename(
    field_name: &str,
    source_node: &str,
    collisions: &HashMap<String, HashSet<String>>,
    node_labels: &NodeLabels,
) -> String {
    match collisions.get(field_name) {
        Some(sources) if sources.len() > 1 => {
            format!("{}_{}", label_for(source_node, node_labels), field_name)
        }
        _ => field_name.to_string(),
    }
}

/// Merge N schemas produced by distinct predecessor nodes into one,
/// resolving name collisions by prefixing with the producing node's label
/// and preserving every field's `source_node` verbatim.
pub fn merge_schemas(schemas: &[DataSchema], node_labels: &NodeLabels) -> DataSchema {
    let collisions = collision_sources(schemas);
    let mut fields = Vec::new();
    let mut seen_names = HashSet::new();

    for schema in schemas {
        for field in &schema.fields {
            let new_name = rename(&field.name, &field.source_node, &collisions, node_labels);
            if seen_names.insert(new_name.clone()) {
                let mut renamed = field.clone();
                renamed.name = new_name;
                fields.push(renamed);
            }
        }
    }

    let mut source_nodes = Vec::new();
    for schema in schemas {
        for node in &schema.source_nodes {
            if !source_nodes.iter().any(|n: &String| n == node) {
                source_nodes.push(node.clone());
            }
        }
    }

    DataSchema { fields, source_nodes }
}

fn rename_record(record: &Record, schema: &DataSchema, collisions: &HashMap<String, HashSet<String>>, node_labels: &NodeLabels) -> Record {
    let mut out = Record::new();
    for (name, value) in record.iter() {
        let source_node = schema.field(name).map(|f| f.source_node.as_str()).unwrap_or("");
        let new_name = rename(name, source_node, collisions, node_labels);
        out.insert(new_name, value.clone());
    }
    out
}

/// Merge envelopes produced by distinct predecessor nodes: concatenate their
/// data in input order (renaming conflicting fields per record using the
/// same rule as `merge_schemas`), and merge their schemas/provenance. Merged
/// envelopes have no single producer, so `node_id`/`node_type` are empty and
/// `custom` is empty.
pub fn merge_envelopes(envelopes: &[DataEnvelope], node_labels: &NodeLabels) -> DataEnvelope {
    if envelopes.is_empty() {
        return DataEnvelope::empty();
    }

    let schemas: Vec<DataSchema> = envelopes.iter().map(|e| e.metadata.schema.clone()).collect();
    let collisions = collision_sources(&schemas);

    let mut data = Vec::new();
    let mut sources = Vec::new();
    let mut record_count = 0usize;

    for envelope in envelopes {
        for record in &envelope.data {
            data.push(rename_record(record, &envelope.metadata.schema, &collisions, node_labels));
        }
        record_count += envelope.data.len();
        for source in &envelope.metadata.sources {
            if !sources.iter().any(|s: &String| s == source) {
                sources.push(source.clone());
            }
        }
    }

    DataEnvelope {
        data,
        metadata: Metadata {
            node_id: String::new(),
            node_type: String::new(),
            record_count,
            execution_time_ms: 0,
            schema: merge_schemas(&schemas, node_labels),
            sources,
            custom: Default::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{FieldDefinition, FieldType};
    use serde_json::json;

    fn schema_with(fields: &[(&str, &str)]) -> DataSchema {
        let mut schema = DataSchema::empty();
        for (name, source) in fields {
            schema.fields.push(FieldDefinition::new(*name, FieldType::String, *source));
        }
        schema.push_source_node(fields.first().map(|(_, s)| *s).unwrap_or(""));
        schema
    }

    fn rec(pairs: &[(&str, &str)]) -> Record {
        let mut m = Record::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), json!(v));
        }
        m
    }

    #[test]
    fn singleton_merge_is_idempotent() {
        let schema = schema_with(&[("id", "A"), ("name", "A")]);
        let labels = NodeLabels::new();
        let merged = merge_schemas(std::slice::from_ref(&schema), &labels);
        let mut merged_names: Vec<_> = merged.fields.iter().map(|f| f.name.clone()).collect();
        merged_names.sort();
        let mut original_names: Vec<_> = schema.fields.iter().map(|f| f.name.clone()).collect();
        original_names.sort();
        assert_eq!(merged_names, original_names);
        assert_eq!(merged.source_nodes, schema.source_nodes);
    }

    #[test]
    fn collision_prefixes_only_conflicting_fields() {
        let schema_a = schema_with(&[("id", "A"), ("name", "A")]);
        let schema_b = schema_with(&[("id", "B"), ("title", "B")]);
        let mut labels = NodeLabels::new();
        labels.insert("A".to_string(), "Users".to_string());
        labels.insert("B".to_string(), "Tasks".to_string());

        let merged = merge_schemas(&[schema_a, schema_b], &labels);
        let names: HashSet<String> = merged.fields.iter().map(|f| f.name.clone()).collect();
        assert_eq!(
            names,
            HashSet::from([
                "Users_id".to_string(),
                "name".to_string(),
                "Tasks_id".to_string(),
                "title".to_string(),
            ])
        );
    }

    #[test]
    fn merge_preserves_provenance() {
        let schema_a = schema_with(&[("id", "A")]);
        let schema_b = schema_with(&[("id", "B")]);
        let labels = NodeLabels::new();
        let merged = merge_schemas(&[schema_a, schema_b], &labels);
        for field in &merged.fields {
            assert!(field.source_node == "A" || field.source_node == "B");
        }
    }

    #[test]
    fn merge_envelopes_concatenates_and_renames() {
        let schema_a = schema_with(&[("id", "A"), ("name", "A")]);
        let schema_b = schema_with(&[("id", "B"), ("title", "B")]);
        let env_a = DataEnvelope {
            data: vec![rec(&[("id", "u1"), ("name", "Alice")]), rec(&[("id", "u2"), ("name", "Bob")])],
            metadata: Metadata { schema: schema_a, sources: vec!["A".into()], ..Metadata::default() },
        };
        let env_b = DataEnvelope {
            data: vec![rec(&[("id", "t1"), ("title", "T1")]), rec(&[("id", "t2"), ("title", "T2")])],
            metadata: Metadata { schema: schema_b, sources: vec!["B".into()], ..Metadata::default() },
        };
        let mut labels = NodeLabels::new();
        labels.insert("A".to_string(), "Users".to_string());
        labels.insert("B".to_string(), "Tasks".to_string());

        let merged = merge_envelopes(&[env_a, env_b], &labels);
        assert_eq!(merged.data.len(), 4);
        assert!(merged.data[0].contains_key("Users_id"));
        assert!(merged.data[2].contains_key("Tasks_id"));
        assert_eq!(merged.metadata.node_id, "");
        assert_eq!(merged.metadata.record_count, 4);
    }

    #[test]
    fn merge_empty_input_yields_empty_envelope() {
        let merged = merge_envelopes(&[], &NodeLabels::new());
        assert!(merged.data.is_empty());
        assert!(merged.metadata.schema.fields.is_empty());
    }
}
