//! HTTP source and destination.
//!
//! Method dispatch, header handling, and JSON/text response decode, plus
//! batching and retry semantics for bulk record delivery that a single
//! request/response round trip never needed.

use crate::connector::{node_id_of, validate_input_position, Connector, ConnectorKind, RunContext};
use crate::envelope::{infer_schema, DataEnvelope, DataSchema, Metadata};
use crate::error::{EngineError, Result};
use crate::value::Record;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

fn headers_of(config: &Value) -> HashMap<String, String> {
    config
        .get("headers")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn reqwest_method(method: &str) -> Result<reqwest::Method> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "DELETE" => Ok(reqwest::Method::DELETE),
        other => Err(EngineError::Config(format!("unsupported HTTP method '{other}'"))),
    }
}

fn value_to_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => {
            let mut record = Record::new();
            record.insert("value".to_string(), other);
            record
        }
    }
}

/// Decode a response body: a top-level sequence is used directly; a mapping
/// with `data` or `items` containing a sequence uses that; anything else is
/// wrapped as a one-element sequence.
fn records_from_json(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items.into_iter().map(value_to_record).collect(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                return items.clone().into_iter().map(value_to_record).collect();
            }
            if let Some(Value::Array(items)) = map.get("items") {
                return items.clone().into_iter().map(value_to_record).collect();
            }
            vec![map]
        }
        other => vec![value_to_record(other)],
    }
}

struct SourceState {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout: Duration,
    node_id: String,
}

#[derive(Default)]
pub struct HttpSource {
    state: Option<SourceState>,
}

impl HttpSource {
    fn state(&self) -> Result<&SourceState> {
        self.state.as_ref().ok_or_else(|| EngineError::Config("http_source: not configured".to_string()))
    }
}

#[async_trait]
impl Connector for HttpSource {
    fn id(&self) -> &'static str {
        "http_source"
    }

    fn name(&self) -> &'static str {
        "HTTP Source"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Source
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string"},
                "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"], "default": "GET"},
                "headers": {"type": "object"},
                "body": {"type": "string"},
                "timeout": {"type": "integer", "default": 30, "minimum": 1, "maximum": 300},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("http_source requires 'url'".to_string()))?
            .to_string();
        let method = config.get("method").and_then(Value::as_str).unwrap_or("GET").to_string();
        reqwest_method(&method)?;
        let timeout_secs = config.get("timeout").and_then(Value::as_u64).unwrap_or(30).clamp(1, 300);
        self.state = Some(SourceState {
            url,
            method,
            headers: headers_of(config),
            body: config.get("body").and_then(Value::as_str).map(str::to_string),
            timeout: Duration::from_secs(timeout_secs),
            node_id: node_id_of(config),
        });
        Ok(())
    }

    fn get_output_schema(&self, input_schema: Option<&DataSchema>) -> Result<DataSchema> {
        validate_input_position(self.kind(), input_schema)?;
        self.state()?;
        Ok(DataSchema::empty())
    }

    fn validate_input_schema(&self, input_schema: Option<&DataSchema>) -> Result<()> {
        validate_input_position(self.kind(), input_schema)
    }

    async fn execute(&self, ctx: &RunContext, _input: DataEnvelope) -> Result<DataEnvelope> {
        ctx.check()?;
        let state = self.state()?;
        let timeout = std::cmp::min(state.timeout, ctx.time_remaining());

        let client = reqwest::Client::new();
        let mut request = client.request(reqwest_method(&state.method)?, &state.url).timeout(timeout);
        for (key, value) in &state.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &state.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("{} {}: {e}", state.method, state.url)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Transport(format!("failed to read response body: {e}")))?;

        let records = match serde_json::from_str::<Value>(&text) {
            Ok(value) => records_from_json(value),
            Err(_) => {
                let mut record = Record::new();
                record.insert("body".to_string(), json!(text));
                vec![record]
            }
        };

        let schema = infer_schema(&records, Some(&state.node_id));

        let mut custom = Map::new();
        custom.insert("url".to_string(), json!(state.url));
        custom.insert("method".to_string(), json!(state.method));
        custom.insert("status_code".to_string(), json!(status.as_u16()));

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
enum BodyFormat {
    JsonArray,
    JsonObject,
    Ndjson,
}

struct DestinationState {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    batch_size: usize,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    format: BodyFormat,
    node_id: String,
}

#[derive(Default)]
pub struct HttpDestination {
    state: Option<DestinationState>,
}

impl HttpDestination {
    fn state(&self) -> Result<&DestinationState> {
        self.state.as_ref().ok_or_else(|| EngineError::Config("http_destination: not configured".to_string()))
    }

    fn batches<'a>(records: &'a [Record], batch_size: usize) -> Vec<&'a [Record]> {
        if records.is_empty() {
            return Vec::new();
        }
        if batch_size == 0 {
            return vec![records];
        }
        records.chunks(batch_size).collect()
    }

    fn serialize(format: BodyFormat, batch: &[Record]) -> (String, &'static str) {
        match format {
            BodyFormat::JsonArray => {
                let value = Value::Array(batch.iter().cloned().map(Value::Object).collect());
                (value.to_string(), "application/json")
            }
            BodyFormat::JsonObject => {
                let value = json!({ "data": batch.iter().cloned().map(Value::Object).collect::<Vec<_>>() });
                (value.to_string(), "application/json")
            }
            BodyFormat::Ndjson => {
                let body = batch
                    .iter()
                    .map(|r| Value::Object(r.clone()).to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                (body, "application/x-ndjson")
            }
        }
    }
}

#[async_trait]
impl Connector for HttpDestination {
    fn id(&self) -> &'static str {
        "http_destination"
    }

    fn name(&self) -> &'static str {
        "HTTP Destination"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Destination
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string"},
                "method": {"type": "string", "enum": ["POST", "PUT", "PATCH"], "default": "POST"},
                "headers": {"type": "object"},
                "batch_size": {"type": "integer", "default": 100, "minimum": 0, "maximum": 1000},
                "timeout_seconds": {"type": "integer", "default": 30, "minimum": 1, "maximum": 300},
                "retry_attempts": {"type": "integer", "default": 3, "minimum": 0, "maximum": 10},
                "retry_delay_ms": {"type": "integer", "default": 1000, "minimum": 100, "maximum": 10000},
                "format": {"type": "string", "enum": ["json_array", "json_object", "ndjson"], "default": "json_array"},
            },
        })
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("http_destination requires 'url'".to_string()))?
            .to_string();
        let method = config.get("method").and_then(Value::as_str).unwrap_or("POST").to_string();
        if !matches!(method.to_uppercase().as_str(), "POST" | "PUT" | "PATCH") {
            return Err(EngineError::Config(format!("unsupported HTTP destination method '{method}'")));
        }
        let format = match config.get("format").and_then(Value::as_str).unwrap_or("json_array") {
            "json_array" => BodyFormat::JsonArray,
            "json_object" => BodyFormat::JsonObject,
            "ndjson" => BodyFormat::Ndjson,
            other => return Err(EngineError::Config(format!("unknown body format '{other}'"))),
        };
        self.state = Some(DestinationState {
            url,
            method,
            headers: headers_of(config),
            batch_size: (config.get("batch_size").and_then(Value::as_u64).unwrap_or(100) as usize).min(1000),
            timeout: Duration::from_secs(config.get("timeout_seconds").and_then(Value::as_u64).unwrap_or(30).clamp(1, 300)),
            retry_attempts: config.get("retry_attempts").and_then(Value::as_u64).unwrap_or(3).clamp(0, 10) as u32,
            retry_delay: Duration::from_millis(config.get("retry_delay_ms").and_then(Value::as_u64).unwrap_or(1000).clamp(100, 10000)),
            format,
            node_id: node_id_of(config),
        });
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
        let state = self.state()?;

        if input.data.is_empty() {
            let mut custom = Map::new();
            custom.insert("records_sent".to_string(), json!(0));
            custom.insert("errors".to_string(), json!(0));
            return Ok(DataEnvelope {
                data: Vec::new(),
                metadata: Metadata {
                    node_id: state.node_id.clone(),
                    node_type: self.id().to_string(),
                    schema: DataSchema::empty(),
                    sources: input.metadata.sources,
                    custom,
                    ..Metadata::default()
                },
            });
        }

        let client = reqwest::Client::new();
        let batches = Self::batches(&input.data, state.batch_size);
        let mut records_sent = 0usize;
        let mut errors = 0usize;
        let mut error_samples = Vec::new();
        let mut successful_batches = 0usize;

        for batch in batches {
            let (body, content_type) = Self::serialize(state.format, batch);
            let mut succeeded = false;

            for attempt in 0..=state.retry_attempts {
                ctx.check()?;
                let method = reqwest_method(&state.method)?;
                let mut request = client.request(method, &state.url).timeout(state.timeout).header("Content-Type", content_type);
                for (key, value) in &state.headers {
                    request = request.header(key, value);
                }
                let attempt_result = request.body(body.clone()).send().await;

                match attempt_result {
                    Ok(response) if response.status().is_success() => {
                        succeeded = true;
                        break;
                    }
                    Ok(response) => {
                        let status = response.status();
                        let retryable = status.as_u16() == 429 || status.is_server_error();
                        if retryable && attempt < state.retry_attempts {
                            tokio::time::sleep(state.retry_delay).await;
                            continue;
                        }
                        if error_samples.len() < 10 {
                            error_samples.push(json!(format!("HTTP {}", status.as_u16())));
                        }
                        break;
                    }
                    Err(e) => {
                        if attempt < state.retry_attempts {
                            tokio::time::sleep(state.retry_delay).await;
                            continue;
                        }
                        if error_samples.len() < 10 {
                            error_samples.push(json!(e.to_string()));
                        }
                        break;
                    }
                }
            }

            if succeeded {
                successful_batches += 1;
                records_sent += batch.len();
            } else {
                errors += batch.len();
            }
        }

        if successful_batches == 0 {
            return Err(EngineError::DestinationIO(format!(
                "http_destination: all {} batch(es) failed",
                error_samples.len().max(1)
            )));
        }

        let mut custom = Map::new();
        custom.insert("records_sent".to_string(), json!(records_sent));
        custom.insert("errors".to_string(), json!(errors));
        custom.insert("error_samples".to_string(), Value::Array(error_samples));

        Ok(DataEnvelope {
            data: Vec::new(),
            metadata: Metadata {
                node_id: state.node_id.clone(),
                node_type: self.id().to_string(),
                record_count: records_sent,
                schema: DataSchema::empty(),
                sources: input.metadata.sources,
                custom,
                ..Metadata::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> RunContext {
        RunContext::new(
            None,
            Duration::from_secs(30),
            std::sync::Arc::new(crate::config::EngineConfig::default()),
        )
    }

    #[tokio::test]
    async fn http_source_decodes_top_level_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
            .mount(&server)
            .await;

        let mut source = HttpSource::default();
        source
            .configure(&json!({"url": format!("{}/items", server.uri()), "__node_id": "n1"}))
            .unwrap();
        let envelope = source.execute(&ctx(), DataEnvelope::empty()).await.unwrap();
        assert_eq!(envelope.data.len(), 2);
        assert_eq!(envelope.metadata.custom.get("status_code").unwrap(), &json!(200));
    }

    #[tokio::test]
    async fn http_source_status_is_non_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
            .mount(&server)
            .await;

        let mut source = HttpSource::default();
        source
            .configure(&json!({"url": format!("{}/broken", server.uri()), "__node_id": "n1"}))
            .unwrap();
        let envelope = source.execute(&ctx(), DataEnvelope::empty()).await.unwrap();
        assert_eq!(envelope.metadata.custom.get("status_code").unwrap(), &json!(500));
    }

    #[tokio::test]
    async fn http_destination_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sink"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sink"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut destination = HttpDestination::default();
        destination
            .configure(&json!({
                "url": format!("{}/sink", server.uri()),
                "retry_attempts": 2,
                "retry_delay_ms": 10,
                "__node_id": "n2",
            }))
            .unwrap();

        let mut record = Record::new();
        record.insert("a".to_string(), json!(1));
        let input = DataEnvelope { data: vec![record], metadata: Metadata::default() };
        let result = destination.execute(&ctx(), input).await.unwrap();
        assert_eq!(result.metadata.custom.get("records_sent").unwrap(), &json!(1));
        assert_eq!(result.metadata.custom.get("errors").unwrap(), &json!(0));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn http_destination_empty_input_succeeds_with_zero_sent() {
        let mut destination = HttpDestination::default();
        destination.configure(&json!({"url": "http://127.0.0.1:1/sink", "__node_id": "n2"})).unwrap();
        let result = destination.execute(&ctx(), DataEnvelope::empty()).await.unwrap();
        assert_eq!(result.metadata.custom.get("records_sent").unwrap(), &json!(0));
    }
}
