//! Upstream record sources: a local JSON file or an HTTP endpoint.
//!
//! Both accept a JSON array of records or an object wrapping one under
//! `data`, `results` or `keywords`. Rows without an `id` are numbered by
//! their 1-based position. An Item without a Line is dropped at load, so
//! every record entering the passes already satisfies the line/item rule.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use linetag_shared::{LinetagError, Record, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::{info, instrument, warn};

const SOURCE_TIMEOUT: Duration = Duration::from_secs(120);
const WRAPPER_KEYS: [&str; 3] = ["data", "results", "keywords"];

/// Where the week's records come from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<Record>>;
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a record payload.
pub fn parse_records(body: &str) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LinetagError::parse(format!("record payload is not JSON: {e}")))?;

    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => WRAPPER_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            })
            .ok_or_else(|| {
                LinetagError::parse("expected a record array or an object with data/results/keywords")
            })?,
        _ => return Err(LinetagError::parse("expected a record array")),
    };

    let mut records = Vec::with_capacity(rows.len());
    let mut seen = HashSet::new();
    for (position, row) in rows.into_iter().enumerate() {
        let row_number = position + 1;
        let Value::Object(mut fields) = row else {
            return Err(LinetagError::parse(format!("row {row_number} is not an object")));
        };
        if fields.get("id").is_none_or(Value::is_null) {
            fields.insert("id".into(), Value::from(row_number));
        }

        let mut record: Record = serde_json::from_value(Value::Object(fields))
            .map_err(|e| LinetagError::parse(format!("row {row_number}: {e}")))?;
        record.keyword = record.keyword.trim().to_string();
        if record.keyword.is_empty() {
            warn!(row = row_number, id = %record.id, "skipping row with blank keyword");
            continue;
        }
        if record.line.is_none() && record.item.is_some() {
            warn!(
                row = row_number,
                id = %record.id,
                item = record.item.as_deref().unwrap_or_default(),
                "dropping item without a line"
            );
            record.item = None;
        }
        if !seen.insert(record.id.clone()) {
            return Err(LinetagError::validation(format!(
                "duplicate record id {} at row {row_number}",
                record.id
            )));
        }
        records.push(record);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Records from a JSON file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn fetch(&self) -> Result<Vec<Record>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| LinetagError::io(&self.path, e))?;
        let records = parse_records(&body)?;
        info!(records = records.len(), "records loaded");
        Ok(records)
    }
}

/// Records from an HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: url::Url,
}

impl HttpSource {
    pub fn new(source_url: &str) -> Result<Self> {
        let url = url::Url::parse(source_url)
            .map_err(|e| LinetagError::config(format!("invalid source URL '{source_url}': {e}")))?;
        let client = Client::builder()
            .timeout(SOURCE_TIMEOUT)
            .build()
            .map_err(|e| LinetagError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RecordSource for HttpSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<Record>> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| LinetagError::Network(format!("record source request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LinetagError::Network(format!(
                "record source returned HTTP {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LinetagError::Network(format!("failed to read record source body: {e}")))?;

        let records = parse_records(&body)?;
        info!(records = records.len(), "records fetched");
        Ok(records)
    }
}
