// src/capture.rs
//! Record of every exchange that passed through the intercepting proxy,
//! optionally appended to a JSONL file.

use std::{path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub duration_ms: u64,
}

impl CaptureRecord {
    pub fn new(method: &str, uri: &str, status: u16, elapsed: Duration) -> Self {
        CaptureRecord {
            timestamp: Utc::now(),
            method: method.to_string(),
            uri: uri.to_string(),
            status,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaptureLog {
    records: Arc<Mutex<Vec<CaptureRecord>>>,
    sink: Option<Arc<Mutex<tokio::fs::File>>>,
}

impl CaptureLog {
    pub async fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let sink = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };
        Ok(CaptureLog {
            records: Arc::default(),
            sink,
        })
    }

    /// A failing sink is logged and skipped; the in-memory record is always kept.
    pub async fn record(&self, record: CaptureRecord) {
        if let Some(sink) = &self.sink {
            if let Err(e) = append_line(sink, &record).await {
                warn!(error = %e, uri = %record.uri, "failed to append capture");
            }
        }
        self.records.lock().await.push(record);
    }

    pub async fn snapshot(&self) -> Vec<CaptureRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

async fn append_line(
    sink: &Mutex<tokio::fs::File>,
    record: &CaptureRecord,
) -> anyhow::Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = sink.lock().await;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
