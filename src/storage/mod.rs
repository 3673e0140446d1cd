//! Durable append-only recording of poll results.
//!
//! Every write lands at a deterministic path:
//! `{base}/{event_scope}/{YYYY-MM-DD}/{category}/{HH-MM-SS.mmm}.ndjson`
//! with one JSON object per line, each tagged with `_recorded_at` and `_data_type`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{AppConfig, StorageBackend};

pub mod local;
pub mod models;
pub mod object;
pub mod state;

pub use local::LocalFileSink;
pub use object::ObjectStoreSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store returned {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("storage not configured: {0}")]
    NotConfigured(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Catalogue,
    Books,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Catalogue => "catalogue",
            Category::Books => "books",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where recordings go. Backends only move bytes; layout and encoding live here.
#[async_trait]
pub trait DurableSink: Send + Sync {
    /// False when recording is switched off; the engine then skips writes entirely.
    fn is_enabled(&self) -> bool {
        true
    }

    fn describe(&self) -> String;

    async fn put(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> SinkResult<()>;

    async fn get(&self, path: &str) -> SinkResult<Option<Vec<u8>>>;

    /// Confirm the target is reachable and writable before relying on it.
    /// Returns a short human-readable description of what was checked.
    async fn check(&self) -> SinkResult<String>;
}

/// Layout shared by all backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathLayout {
    pub base_path: String,
    pub event_scope: String,
}

impl PathLayout {
    pub fn new(base_path: &str, event_scope: &str) -> Self {
        Self {
            base_path: base_path.trim_matches('/').to_string(),
            event_scope: event_scope.to_string(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(&cfg.storage.base_path, &cfg.recorder.event_type_id)
    }

    pub fn record_path(&self, category: Category, ts: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/{}/{}.ndjson",
            self.base_path,
            self.event_scope,
            ts.format("%Y-%m-%d"),
            category,
            ts.format("%H-%M-%S%.3f"),
        )
    }

    pub fn runtime_config_path(&self) -> String {
        format!("{}/config/runtime_config.toml", self.base_path)
    }
}

/// Tag each record with recording metadata and join them as NDJSON.
pub fn encode_ndjson<T: Serialize>(
    category: Category,
    records: &[T],
    ts: DateTime<Utc>,
) -> SinkResult<Vec<u8>> {
    let recorded_at = ts.to_rfc3339();
    let mut out = Vec::new();
    for record in records {
        let mut line = Map::new();
        line.insert("_recorded_at".to_string(), Value::String(recorded_at.clone()));
        line.insert(
            "_data_type".to_string(),
            Value::String(category.as_str().to_string()),
        );
        match serde_json::to_value(record)? {
            Value::Object(fields) => line.extend(fields),
            other => {
                line.insert("value".to_string(), other);
            }
        }
        serde_json::to_writer(&mut out, &Value::Object(line))?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Append one batch of records and return the logical path written.
pub async fn write_records<T: Serialize>(
    sink: &dyn DurableSink,
    layout: &PathLayout,
    category: Category,
    records: &[T],
    ts: DateTime<Utc>,
) -> SinkResult<String> {
    let path = layout.record_path(category, ts);
    let bytes = encode_ndjson(category, records, ts)?;
    sink.put(&path, "application/x-ndjson", bytes).await?;
    Ok(path)
}

/// Sink used when recording is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl DurableSink for NullSink {
    fn is_enabled(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "none".to_string()
    }

    async fn put(&self, path: &str, _content_type: &str, _bytes: Vec<u8>) -> SinkResult<()> {
        Err(SinkError::NotConfigured(format!("recording disabled, dropped {path}")))
    }

    async fn get(&self, _path: &str) -> SinkResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn check(&self) -> SinkResult<String> {
        Err(SinkError::NotConfigured("storage backend is none".to_string()))
    }
}

/// Build the sink selected by the storage section.
pub fn sink_from_config(cfg: &AppConfig) -> SinkResult<Arc<dyn DurableSink>> {
    let sink: Arc<dyn DurableSink> = match cfg.storage.backend {
        StorageBackend::None => Arc::new(NullSink),
        StorageBackend::Local => Arc::new(LocalFileSink::new(&cfg.storage.root)),
        StorageBackend::Gcs => {
            Arc::new(ObjectStoreSink::new(&cfg.storage.bucket, &cfg.storage.access_token)?)
        }
    };
    Ok(sink)
}
