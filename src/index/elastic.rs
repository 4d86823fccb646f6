use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::debug;

use super::{
    AppendEntry, BulkItem, BulkOperation, BulkResponse, IndexSettings, IndexWriter, ItemOutcome,
    Visibility,
};
use crate::error::GenodexError;

const APPEND_SCRIPT: &str = r#"
boolean changed = false;
for (def field : params.base.entrySet()) {
  if (ctx._source[field.getKey()] == null) {
    ctx._source[field.getKey()] = field.getValue();
    changed = true;
  }
}
if (!(ctx._source[params.collection] instanceof List)) {
  ctx._source[params.collection] = new ArrayList();
  changed = true;
}
boolean found = false;
for (def item : ctx._source[params.collection]) {
  boolean same = true;
  for (def key : params.keys) {
    if (item[key] != params.entry[key]) { same = false; break; }
  }
  if (same) { found = true; break; }
}
if (!found) {
  ctx._source[params.collection].add(params.entry);
  changed = true;
}
if (!changed) { ctx.op = 'noop'; }
"#;

/// Elasticsearch / OpenSearch REST client.
#[derive(Clone)]
pub struct ElasticIndex {
    client: Client,
    base_url: String,
}

impl ElasticIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GenodexError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("genodex/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GenodexError::IndexHttp(err.to_string()))?,
        );
        if let Ok(api_key) = std::env::var("GENODEX_INDEX_API_KEY") {
            if !api_key.trim().is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("ApiKey {}", api_key.trim()))
                        .map_err(|err| GenodexError::IndexHttp(err.to_string()))?,
                );
            }
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| GenodexError::IndexHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, GenodexError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && matches!(status, 429 | 502 | 503 | 504) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "document store busy, retrying");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(GenodexError::IndexHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, GenodexError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "document store request failed".to_string());
        Err(GenodexError::IndexStatus { status, message })
    }

    fn read_json(response: reqwest::blocking::Response) -> Result<Value, GenodexError> {
        Self::handle_status(response)?
            .json()
            .map_err(|err| GenodexError::IndexHttp(err.to_string()))
    }
}

impl IndexWriter for ElasticIndex {
    fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        visibility: Visibility,
    ) -> Result<BulkResponse, GenodexError> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = bulk_body(index, operations)?;
        let url = format!("{}/_bulk", self.base_url);
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .query(&[("refresh", visibility.as_refresh_param())])
                .header(CONTENT_TYPE, "application/x-ndjson")
                .body(body.clone())
        })?;
        let raw = Self::read_json(response)?;
        Ok(parse_bulk_response(&raw, operations))
    }

    fn settings(&self, index: &str) -> Result<IndexSettings, GenodexError> {
        let url = format!("{}/{}/_settings", self.base_url, index);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("flat_settings", "true"), ("include_defaults", "false")])
        })?;
        let raw = Self::read_json(response)?;
        Ok(parse_settings(&raw, index))
    }

    fn put_settings(&self, index: &str, settings: &IndexSettings) -> Result<(), GenodexError> {
        let url = format!("{}/{}/_settings", self.base_url, index);
        let body = json!({
            "index": {
                "refresh_interval": settings.refresh_interval,
                "number_of_replicas": settings.number_of_replicas,
            }
        });
        let response = self.send_with_retries(|| self.client.put(&url).json(&body))?;
        Self::handle_status(response)?;
        Ok(())
    }

    fn refresh(&self, index: &str) -> Result<(), GenodexError> {
        let url = format!("{}/{}/_refresh", self.base_url, index);
        let response = self.send_with_retries(|| self.client.post(&url))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

/// NDJSON body for the `_bulk` endpoint.
pub fn bulk_body(index: &str, operations: &[BulkOperation]) -> Result<String, GenodexError> {
    let mut body = String::new();
    for operation in operations {
        let (action, source) = match operation {
            BulkOperation::Index { id, document } => (
                json!({"index": {"_index": index, "_id": id}}),
                Value::Object(document.clone()),
            ),
            BulkOperation::Append { id, append } => (
                json!({"update": {"_index": index, "_id": id, "retry_on_conflict": 3}}),
                append_request(append),
            ),
        };
        for line in [action, source] {
            let encoded = serde_json::to_string(&line)
                .map_err(|err| GenodexError::IndexHttp(err.to_string()))?;
            body.push_str(&encoded);
            body.push('\n');
        }
    }
    Ok(body)
}

fn append_request(append: &AppendEntry) -> Value {
    let mut upsert = append.base_fields.clone();
    upsert.insert(append.collection.clone(), Value::Array(Vec::new()));
    json!({
        "scripted_upsert": true,
        "script": {
            "lang": "painless",
            "source": APPEND_SCRIPT,
            "params": {
                "base": append.base_fields,
                "collection": append.collection,
                "entry": append.entry,
                "keys": append.dedup_keys,
            }
        },
        "upsert": upsert,
    })
}

fn parse_bulk_response(raw: &Value, operations: &[BulkOperation]) -> BulkResponse {
    let items = raw
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut parsed = Vec::with_capacity(operations.len());
    for (position, operation) in operations.iter().enumerate() {
        let detail = items
            .get(position)
            .and_then(Value::as_object)
            .and_then(|item| item.values().next());
        let id = detail
            .and_then(|d| d.get("_id"))
            .and_then(Value::as_str)
            .unwrap_or(operation.id())
            .to_string();
        let outcome = match detail {
            None => ItemOutcome::Failed {
                status: 0,
                reason: "missing from bulk response".to_string(),
            },
            Some(detail) => item_outcome(detail),
        };
        parsed.push(BulkItem { id, outcome });
    }
    BulkResponse { items: parsed }
}

fn item_outcome(detail: &Value) -> ItemOutcome {
    let status = detail.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
    if let Some(error) = detail.get("error") {
        let reason = match (
            error.get("type").and_then(Value::as_str),
            error.get("reason").and_then(Value::as_str),
        ) {
            (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
            (Some(kind), None) => kind.to_string(),
            (None, Some(reason)) => reason.to_string(),
            (None, None) => error.to_string(),
        };
        return ItemOutcome::Failed { status, reason };
    }
    match detail.get("result").and_then(Value::as_str) {
        Some("created") => ItemOutcome::Created,
        Some("noop") => ItemOutcome::Noop,
        _ if (200..300).contains(&status) => ItemOutcome::Updated,
        _ => ItemOutcome::Failed {
            status,
            reason: "unexpected bulk item status".to_string(),
        },
    }
}

fn parse_settings(raw: &Value, index: &str) -> IndexSettings {
    let settings = raw
        .get(index)
        .or_else(|| raw.as_object().and_then(|map| map.values().next()))
        .and_then(|entry| entry.get("settings"));
    let flat = |key: &str| settings.and_then(|s| s.get(key));
    IndexSettings {
        refresh_interval: flat("index.refresh_interval")
            .and_then(Value::as_str)
            .map(str::to_string),
        number_of_replicas: flat("index.number_of_replicas").and_then(|value| match value {
            Value::String(text) => text.parse().ok(),
            other => other.as_u64().map(|n| n as u32),
        }),
    }
}
