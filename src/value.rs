//! The dynamic value shape every connector boundary trades in.
//!
//! The closed value set — `{null, bool, number, string, sequence, record}` —
//! maps isomorphically onto `serde_json::Value`'s variants (`Null`, `Bool`,
//! `Number`, `String`, `Array`, `Object`). Rather than invent a parallel
//! tagged enum, this uses `serde_json::Value` directly at every connector
//! boundary: a dynamic-any with runtime type checks, not a static schema
//! baked into Rust's type system.

use serde_json::{Map, Value};

/// An unordered mapping from field name to value — one row of data.
pub type Record = Map<String, Value>;

/// Every field name referenced anywhere in the engine must be non-empty;
/// connectors should reject configs that would produce one.
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty()
}
