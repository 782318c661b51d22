//! Piece-run event sink and NDJSON session log (§6)
//!
//! Every phase transition the engine makes is turned into an [`Event`] and
//! handed to a [`Sink`]. The production sink appends one JSON record per
//! line to a per-run log file; tests use [`VecSink`] to assert on the
//! sequence directly.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to write session log at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PieceStart { piece: String },
    MovementStart { movement: String },
    MovementPhase { movement: String, phase: Phase, match_method: Option<String> },
    MovementComplete { movement: String },
    PieceComplete { status: String },
    PieceAbort { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    One,
    Two,
    Three,
}

#[derive(Serialize)]
struct Record<'a> {
    #[serde(flatten)]
    event: &'a Event,
    timestamp: String,
}

pub trait Sink: Send + Sync {
    fn emit(&self, event: Event) -> Result<(), EventError>;
}

/// Appends one NDJSON record per event to a file, line-buffered.
pub struct FileSink {
    file: std::sync::Mutex<std::fs::File>,
    path: PathBuf,
}

impl FileSink {
    pub fn create(path: PathBuf) -> Result<Self, EventError> {
        debug!(?path, "FileSink::create: called");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| EventError::Io { path: path.clone(), source })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EventError::Io { path: path.clone(), source })?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
            path,
        })
    }
}

impl Sink for FileSink {
    fn emit(&self, event: Event) -> Result<(), EventError> {
        let record = Record {
            event: &event,
            timestamp: Utc::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&record).expect("Event is always serializable");
        let mut file = self.file.lock().expect("session log file lock poisoned");
        writeln!(file, "{line}").map_err(|source| EventError::Io {
            path: self.path.clone(),
            source,
        })?;
        file.flush().map_err(|source| EventError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct VecSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("VecSink lock poisoned").clone()
    }
}

impl Sink for VecSink {
    fn emit(&self, event: Event) -> Result<(), EventError> {
        self.events.lock().expect("VecSink lock poisoned").push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path).unwrap().lines().map(str::to_string).collect()
    }

    #[test]
    fn file_sink_appends_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.ndjson");
        let sink = FileSink::create(path.clone()).unwrap();
        sink.emit(Event::PieceStart { piece: "demo".into() }).unwrap();
        sink.emit(Event::PieceComplete { status: "completed".into() }).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("piece_start"));
        assert!(lines[1].contains("piece_complete"));
    }

    #[test]
    fn vec_sink_preserves_order() {
        let sink = VecSink::new();
        sink.emit(Event::MovementStart { movement: "work".into() }).unwrap();
        sink.emit(Event::MovementComplete { movement: "work".into() }).unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 2);
    }
}
