//! Record-store ("PocketBase-style") source and destination.
//!
//! Lazily-created, cached `SqlitePool`s live behind an `RwLock<HashMap<..>>`
//! (read-lock fast path, write-lock double-check on miss); reads and writes
//! bind columns dynamically via `sqlx::Row` introspection rather than fixed
//! structs. A "collection" maps onto a dynamic SQLite table directly. The
//! real record-store backing this stands in for is out of scope here; this
//! is a self-contained SQLite backend sufficient to exercise the connector
//! contract end to end.

use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{DataEnvelope, DataSchema, Metadata};
use crate::error::{EngineError, Result};
use crate::value::Record;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Column, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::RwLock;

fn pool_cache() -> &'static RwLock<HashMap<String, SqlitePool>> {
    static CACHE: OnceLock<RwLock<HashMap<String, SqlitePool>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Get or lazily create the pool for `db_path`. Read-lock fast path for an
/// already-open pool; write-lock double-check on miss, exactly the shape of
/// `ProjectDatabaseManager::get_simpletable_pool`.
async fn pool_for(db_path: &PathBuf) -> Result<SqlitePool> {
    let key = db_path.display().to_string();
    {
        let pools = pool_cache().read().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
    }

    let mut pools = pool_cache().write().await;
    if let Some(pool) = pools.get(&key) {
        return Ok(pool.clone());
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::SourceIO(format!("cannot create '{}': {e}", parent.display())))?;
    }
    let options = SqliteConnectOptions::new().filename(db_path).create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(|e| EngineError::SourceIO(format!("cannot open record store '{}': {e}", db_path.display())))?;
    pools.insert(key, pool.clone());
    Ok(pool)
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn resolve_database(config: &Value) -> PathBuf {
    let relative = config.get("database").and_then(Value::as_str).unwrap_or("record_store.db");
    crate::config::EngineConfig::default().data_dir.join("storage").join(relative)
}

const SYSTEM_FIELDS: [&str; 3] = ["collectionId", "collectionName", "expand"];

fn strip_system_fields(mut record: Record) -> Record {
    for field in SYSTEM_FIELDS {
        record.remove(field);
    }
    record
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Record {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value: Option<String> = row.try_get(i).unwrap_or(None);
        let json_value = match value {
            None => Value::Null,
            Some(v) => {
                if let Ok(n) = v.parse::<i64>() {
                    json!(n)
                } else if let Ok(f) = v.parse::<f64>() {
                    json!(f)
                } else if v == "true" || v == "false" {
                    json!(v == "true")
                } else {
                    json!(v)
                }
            }
        };
        record.insert(name, json_value);
    }
    strip_system_fields(record)
}

fn sort_clause(sort: &str) -> Option<String> {
    let parts: Vec<String> = sort
        .split(',')
        .filter_map(|raw| {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            let (column, direction) = if let Some(stripped) = raw.strip_prefix('-') {
                (stripped, "DESC")
            } else {
                (raw, "ASC")
            };
            if valid_identifier(column) {
                Some(format!("{column} {direction}"))
            } else {
                None
            }
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

struct SourceState {
    collection: String,
    filter: Option<String>,
    sort: Option<String>,
    batch_size: u32,
    max_records: u64,
    ignore_user_filter: bool,
    db_path: PathBuf,
    node_id: String,
}

#[derive(Default)]
pub struct RecordStoreSource {
    state: Option<SourceState>,
}

impl RecordStoreSource {
    fn state(&self) -> Result<&SourceState> {
        self.state.as_ref().ok_or_else(|| EngineError::Config("record_store_source: not configured".to_string()))
    }
}

#[async_trait]
impl Connector for RecordStoreSource {
    fn id(&self) -> &'static str {
        "record_store_source"
    }

    fn name(&self) -> &'static str {
        "Record Store Source"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Source
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["collection"],
            "properties": {
                "collection": {"type": "string"},
                "filter": {"type": "string"},
                "sort": {"type": "string", "description": "e.g. '-created,title'"},
                "batch_size": {"type": "integer", "default": 100, "maximum": 500},
                "max_records": {"type": "integer", "default": 0, "description": "0 = unlimited"},
                "ignore_user_filter": {"type": "boolean", "default": false},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let collection = config
            .get("collection")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("record_store_source requires 'collection'".to_string()))?
            .to_string();
        if !valid_identifier(&collection) {
            return Err(EngineError::Config(format!("invalid collection name '{collection}'")));
        }
        self.state = Some(SourceState {
            collection,
            filter: config.get("filter").and_then(Value::as_str).map(str::to_string),
            sort: config.get("sort").and_then(Value::as_str).map(str::to_string),
            batch_size: (config.get("batch_size").and_then(Value::as_u64).unwrap_or(100) as u32).min(500),
            max_records: config.get("max_records").and_then(Value::as_u64).unwrap_or(0),
            ignore_user_filter: config.get("ignore_user_filter").and_then(Value::as_bool).unwrap_or(false),
            db_path: resolve_database(config),
            node_id: node_id_of(config),
        });
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        self.state()?;
        // Static introspection would require an async SQLite round trip,
        // which this synchronous method cannot perform; falls back to
        // runtime inference, which `execute` does via `infer_schema`.
        Ok(DataSchema::empty())
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, _input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let state = self.state()?;

        if !state.ignore_user_filter && ctx.user_id.is_none() {
            return Err(EngineError::Auth(
                "record_store_source requires a context user id unless ignore_user_filter is set".to_string(),
            ));
        }

        let pool = pool_for(&state.db_path).await?;

        let mut clauses = Vec::new();
        if let Some(filter) = &state.filter {
            if !filter.is_empty() {
                clauses.push(format!("({filter})"));
            }
        }
        if !state.ignore_user_filter {
            if let Some(user_id) = &ctx.user_id {
                clauses.push(format!("user = '{}'", user_id.replace('\'', "''")));
            }
        }

        let mut query = format!("SELECT * FROM {}", state.collection);
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = state.sort.as_deref().and_then(sort_clause) {
            query.push_str(" ORDER BY ");
            query.push_str(&order);
        }

        let mut records = Vec::new();
        let mut offset: u64 = 0;
        loop {
            ctx.check()?;
            let limit = state.batch_size as u64;
            let page_query = format!("{query} LIMIT {limit} OFFSET {offset}");
            let rows = sqlx::query(&page_query)
                .fetch_all(&pool)
                .await
                .map_err(|e| EngineError::SourceIO(format!("record store query failed: {e}")))?;
            let page_len = rows.len();
            for row in &rows {
                records.push(row_to_record(row));
                if state.max_records > 0 && records.len() as u64 >= state.max_records {
                    break;
                }
            }
            offset += limit;
            let hit_max = state.max_records > 0 && records.len() as u64 >= state.max_records;
            if page_len < state.batch_size as usize || hit_max {
                break;
            }
        }

        let schema = crate::envelope::infer_schema(&records, Some(&state.node_id));

        let mut custom = Map::new();
        custom.insert("collection".to_string(), json!(state.collection));

        Ok(DataEnvelope {
            data: records.clone(),
            metadata: Metadata {
                node_id: state.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: records.len(),
                schema,
                sources: vec![state.node_id.clone()].into_iter().filter(|s| !s.is_empty()).collect(),
                custom,
                ..Metadata::default()
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Update,
    Upsert,
}

struct DestinationState {
    collection: String,
    mode: WriteMode,
    id_field: String,
    batch_size: usize,
    user_field: String,
    db_path: PathBuf,
    node_id: String,
}

#[derive(Default)]
pub struct RecordStoreDestination {
    state: Option<DestinationState>,
}

impl RecordStoreDestination {
    fn state(&self) -> Result<&DestinationState> {
        self.state.as_ref().ok_or_else(|| EngineError::Config("record_store_destination: not configured".to_string()))
    }

    async fn ensure_table(pool: &SqlitePool, collection: &str, id_field: &str) -> Result<()> {
        let create_sql = format!("CREATE TABLE IF NOT EXISTS {collection} ({id_field} TEXT PRIMARY KEY)");
        sqlx::query(&create_sql)
            .execute(pool)
            .await
            .map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        Ok(())
    }

    async fn existing_columns(pool: &SqlitePool, collection: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({collection})"))
            .fetch_all(pool)
            .await
            .map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        Ok(rows.into_iter().filter_map(|r| r.try_get::<String, _>("name").ok()).collect())
    }

    async fn ensure_columns(pool: &SqlitePool, collection: &str, record: &Record, known: &mut Vec<String>) -> Result<()> {
        for key in record.keys() {
            if !valid_identifier(key) {
                continue;
            }
            if !known.iter().any(|k| k == key) {
                sqlx::query(&format!("ALTER TABLE {collection} ADD COLUMN {key} TEXT"))
                    .execute(pool)
                    .await
                    .map_err(|e| EngineError::DestinationIO(e.to_string()))?;
                known.push(key.clone());
            }
        }
        Ok(())
    }

    fn stringify(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[async_trait]
impl Connector for RecordStoreDestination {
    fn id(&self) -> &'static str {
        "record_store_destination"
    }

    fn name(&self) -> &'static str {
        "Record Store Destination"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Destination
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["collection"],
            "properties": {
                "collection": {"type": "string"},
                "mode": {"type": "string", "enum": ["create", "update", "upsert"], "default": "create"},
                "id_field": {"type": "string", "default": "id"},
                "batch_size": {"type": "integer", "default": 100, "maximum": 500},
                "user_field": {"type": "string", "default": "user"},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let collection = config
            .get("collection")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("record_store_destination requires 'collection'".to_string()))?
            .to_string();
        if !valid_identifier(&collection) {
            return Err(EngineError::Config(format!("invalid collection name '{collection}'")));
        }
        let mode = match config.get("mode").and_then(Value::as_str).unwrap_or("create") {
            "create" => WriteMode::Create,
            "update" => WriteMode::Update,
            "upsert" => WriteMode::Upsert,
            other => return Err(EngineError::Config(format!("unknown record store mode '{other}'"))),
        };
        let id_field = config.get("id_field").and_then(Value::as_str).unwrap_or("id").to_string();
        if !valid_identifier(&id_field) {
            return Err(EngineError::Config(format!("invalid id_field '{id_field}'")));
        }
        self.state = Some(DestinationState {
            collection,
            mode,
            id_field,
            batch_size: (config.get("batch_size").and_then(Value::as_u64).unwrap_or(100) as usize).min(500),
            user_field: config.get("user_field").and_then(Value::as_str).unwrap_or("user").to_string(),
            db_path: resolve_database(config),
            node_id: node_id_of(config),
        });
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
        let state = self.state()?;
        let pool = pool_for(&state.db_path).await?;
        Self::ensure_table(&pool, &state.collection, &state.id_field).await?;
        let mut known_columns = Self::existing_columns(&pool, &state.collection).await?;

        let mut written = 0usize;
        let mut errors = 0usize;
        let mut error_samples = Vec::new();

        for chunk in input.data.chunks(state.batch_size.max(1)) {
            for record in chunk {
                ctx.check()?;
                let mut record = record.clone();
                if !state.user_field.is_empty() && !record.contains_key(&state.user_field) {
                    if let Some(user_id) = &ctx.user_id {
                        record.insert(state.user_field.clone(), json!(user_id));
                    }
                }

                let outcome = match state.mode {
                    WriteMode::Create => Self::create(&pool, state, &mut known_columns, &record).await,
                    WriteMode::Update => Self::update(&pool, state, &record).await,
                    WriteMode::Upsert => Self::upsert(&pool, state, &mut known_columns, &record).await,
                };

                match outcome {
                    Ok(()) => written += 1,
                    Err(e) => {
                        errors += 1;
                        if error_samples.len() < 10 {
                            error_samples.push(json!(e.to_string()));
                        }
                    }
                }
            }
        }

        if written == 0 && !input.data.is_empty() {
            return Err(EngineError::DestinationIO(format!(
                "record_store_destination: every record failed ({} error(s))",
                errors
            )));
        }

        let mut custom = Map::new();
        custom.insert("records_written".to_string(), json!(written));
        custom.insert("errors".to_string(), json!(errors));
        custom.insert("error_samples".to_string(), Value::Array(error_samples));

        Ok(DataEnvelope {
            data: Vec::new(),
            metadata: Metadata {
                node_id: state.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: written,
                schema: DataSchema::empty(),
                sources: input.metadata.sources,
                custom,
                ..Metadata::default()
            },
        })
    }
}

impl RecordStoreDestination {
    async fn create(
        pool: &SqlitePool,
        state: &DestinationState,
        known_columns: &mut Vec<String>,
        record: &Record,
    ) -> Result<()> {
        Self::ensure_columns(pool, &state.collection, record, known_columns).await?;
        let id_value = record
            .get(&state.id_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut columns = vec![state.id_field.clone()];
        let mut placeholders = vec!["?".to_string()];
        let mut values = vec![Some(id_value)];
        for (key, value) in record.iter() {
            if key == &state.id_field || !valid_identifier(key) {
                continue;
            }
            columns.push(key.clone());
            placeholders.push("?".to_string());
            values.push(Self::stringify(value));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            state.collection,
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }
        query.execute(pool).await.map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        Ok(())
    }

    async fn update(pool: &SqlitePool, state: &DestinationState, record: &Record) -> Result<()> {
        let id_value = record
            .get(&state.id_field)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config(format!("record missing '{}' for update", state.id_field)))?;

        let assignments: Vec<String> = record
            .keys()
            .filter(|k| *k != &state.id_field && valid_identifier(k))
            .map(|k| format!("{k} = ?"))
            .collect();
        if assignments.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            state.collection,
            assignments.join(", "),
            state.id_field
        );
        let mut query = sqlx::query(&sql);
        for key in record.keys().filter(|k| *k != &state.id_field && valid_identifier(k)) {
            query = query.bind(Self::stringify(&record[key]));
        }
        query = query.bind(id_value.to_string());
        let result = query.execute(pool).await.map_err(|e| EngineError::DestinationIO(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngineError::DestinationIO(format!("no record with {}={}", state.id_field, id_value)));
        }
        Ok(())
    }

    async fn upsert(
        pool: &SqlitePool,
        state: &DestinationState,
        known_columns: &mut Vec<String>,
        record: &Record,
    ) -> Result<()> {
        let has_id = record.get(&state.id_field).and_then(Value::as_str).is_some();
        if has_id {
            match Self::update(pool, state, record).await {
                Ok(()) => Ok(()),
                Err(_) => Self::create(pool, state, known_columns, record).await,
            }
        } else {
            Self::create(pool, state, known_columns, record).await
        }
    }
}
