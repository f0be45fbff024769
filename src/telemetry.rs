use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::errors::AppResult;

/// Append-only JSONL journal of pipeline events. Disabled when no path is
/// configured; events are buffered and written in batches.
#[derive(Clone)]
pub struct TelemetryClient {
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    journal_path: Option<PathBuf>,
    batch_size: usize,
}

impl TelemetryClient {
    pub fn new(config: &PipelineConfig) -> AppResult<Self> {
        let Some(path) = config.telemetry_path.clone() else {
            return Ok(Self::disabled());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            journal_path: Some(path),
            batch_size: config.telemetry_batch_size.max(1),
        })
    }

    pub fn disabled() -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            journal_path: None,
            batch_size: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.journal_path.is_some()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(TelemetryEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// The queue is only cleared once every line reached the file.
    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        let Some(path) = &self.journal_path else {
            queue.clear();
            return Ok(());
        };
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}
