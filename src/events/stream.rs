//! Append-only event stream.
//!
//! Each event becomes one line:
//!
//! ```text
//! <timestamp>|<source>|<destination>|<TYPE>|key=value key=value
//! ```
//!
//! The timestamp is UTC RFC 3339. Values containing whitespace, `|`, `=` or
//! quotes are double-quoted with backslash escapes.

use async_trait::async_trait;
use chrono::SecondsFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use super::{Event, EventHandler};

/// Destination used for events addressed to every listener.
pub const BROADCAST: &str = "*";

/// Errors raised by append-only sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on event log: {0}")]
    Io(#[from] std::io::Error),

    #[error("event log lock poisoned")]
    LockPoisoned,
}

/// A log that only ever grows by whole records.
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append one record. The record must not contain a newline.
    async fn append(&self, record: &str) -> Result<(), SinkError>;
}

/// Append-only log backed by a file, opened lazily in append mode.
pub struct FileAppendLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileAppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AppendLog for FileAppendLog {
    async fn append(&self, record: &str) -> Result<(), SinkError> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            let mut line = String::with_capacity(record.len() + 1);
            line.push_str(record);
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// In-memory append-only log.
#[derive(Default)]
pub struct MemoryAppendLog {
    lines: std::sync::Mutex<Vec<String>>,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every appended record.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AppendLog for MemoryAppendLog {
    async fn append(&self, record: &str) -> Result<(), SinkError> {
        self.lines
            .lock()
            .map_err(|_| SinkError::LockPoisoned)?
            .push(record.to_string());
        Ok(())
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '|' | '=' | '"' | '\\'));
    if !needs_quotes {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '|' => out.push_str("\\|"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render an event as one stream line.
pub fn format_line(event: &Event, source: &str, destination: &str) -> String {
    let payload = event
        .payload()
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, quote_value(&value)))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "{}|{}|{}|{}|{}",
        event
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        source,
        destination,
        event.kind(),
        payload
    )
}

/// Event handler that writes every event to an [`AppendLog`].
///
/// Write failures are logged and swallowed: losing an event line never fails
/// a run.
pub struct EventStreamWriter {
    log: Arc<dyn AppendLog>,
    destination: String,
}

impl EventStreamWriter {
    /// Writer that broadcasts every event.
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        Self {
            log,
            destination: BROADCAST.to_string(),
        }
    }

    /// Address events to a specific destination.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }
}

#[async_trait]
impl EventHandler for EventStreamWriter {
    async fn handle(&self, event: &Event) {
        let source = format!("dagflow:{}", event.run_id());
        let line = format_line(event, &source, &self.destination);
        if let Err(e) = self.log.append(&line).await {
            error!(error = %e, event = event.kind(), "failed to append event");
        }
    }
}
