//! Diagnostics: non-fatal anomaly reports, optionally persisted to
//! `~/.local/share/chatsync/diagnostics.jsonl`.
//!
//! Reports are fire-and-forget:
//! - The engine hands a [`DiagnosticEvent`] to whatever [`DiagnosticSink`] it
//!   was given and carries on with its own return value
//! - Sinks swallow their own failures
//!
//! The JSONL format keeps one record per anomaly so the `diagnostics`
//! subcommand can list them later.
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ── Storage path ──────────────────────────────────────────────────────────────

pub fn default_path() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share")
        });
    base.join("chatsync").join("diagnostics.jsonl")
}

// ── Event record (one line in diagnostics.jsonl) ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// tool_result ids didn't line up with the assistant's tool_use ids
    ToolResultMismatch,
    /// tool_use ids with no result; placeholders were synthesized
    MissingToolResults,
    /// A line on the host channel that didn't parse
    MalformedHostEvent,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolResultMismatch => "tool_result_mismatch",
            Self::MissingToolResults => "missing_tool_results",
            Self::MalformedHostEvent => "malformed_host_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub timestamp: i64,
    pub kind: DiagnosticKind,
    pub message: String,
    /// Offending ids, counts, raw previews
    #[serde(default)]
    pub details: Value,
}

impl DiagnosticEvent {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, details: Value) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            kind,
            message: message.into(),
            details,
        }
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// External observability collector. Must never fail the caller.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, event: &DiagnosticEvent);
}

/// Discards everything.
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn report(&self, _event: &DiagnosticEvent) {}
}

/// Emits each event as a `warn!` log line.
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, event: &DiagnosticEvent) {
        tracing::warn!(kind = ?event.kind, details = %event.details, "{}", event.message);
    }
}

/// Appends events to a JSONL file and logs them.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for JsonlSink {
    fn report(&self, event: &DiagnosticEvent) {
        LogSink.report(event);
        if let Err(e) = append_event(&self.path, event) {
            tracing::debug!(path = %self.path.display(), error = %e, "diagnostic not persisted");
        }
    }
}

/// Keeps events in memory, for embedders that surface them in their own UI.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, event: &DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

fn append_event(path: &Path, event: &DiagnosticEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Load all events from a diagnostics file, oldest-first. Unparseable lines
/// are skipped.
pub fn load_all(path: &Path) -> Vec<DiagnosticEvent> {
    let Ok(content) = std::fs::read_to_string(path) else { return Vec::new() };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Delete all recorded diagnostics. Returns Ok(()) if the file didn't exist.
pub fn clear_all(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = DiagnosticEvent {
            timestamp: 1625145600,
            kind: DiagnosticKind::MissingToolResults,
            message: "2 tool_use ids had no result".to_string(),
            details: json!({"missingIds": ["a", "b"]}),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"missing_tool_results\""));
        let back: DiagnosticEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_jsonl_sink_appends_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("diagnostics.jsonl");
        let sink = JsonlSink::new(&path);
        sink.report(&DiagnosticEvent::new(DiagnosticKind::ToolResultMismatch, "first", json!({})));
        sink.report(&DiagnosticEvent::new(DiagnosticKind::MalformedHostEvent, "second", json!("{x")));

        let events = load_all(sink.path());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].kind, DiagnosticKind::MalformedHostEvent);

        clear_all(&path).unwrap();
        assert!(load_all(&path).is_empty());
        // Clearing twice is fine
        clear_all(&path).unwrap();
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.jsonl");
        let good = DiagnosticEvent::new(DiagnosticKind::MissingToolResults, "ok", Value::Null);
        let content = format!("not json\n\n{}\n", serde_json::to_string(&good).unwrap());
        std::fs::write(&path, content).unwrap();
        assert_eq!(load_all(&path), vec![good]);
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let sink = JsonlSink::new(dir.path());
        sink.report(&DiagnosticEvent::new(DiagnosticKind::MissingToolResults, "x", Value::Null));
    }

    #[test]
    fn test_recording_sink_collects() {
        let sink = RecordingSink::default();
        assert!(sink.events().is_empty());
        sink.report(&DiagnosticEvent::new(DiagnosticKind::MissingToolResults, "x", Value::Null));
        assert_eq!(sink.events().len(), 1);
    }
}
