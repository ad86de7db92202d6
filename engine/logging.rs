//! Structured event side channel.
//!
//! Long identification runs produce per-identification detail (every
//! candidate's log-probability) that is far too bulky for the text log but
//! valuable for offline analysis. Events go to an injected sink so a host
//! can capture them, redirect them, or turn them off entirely for speed.

use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error writing event log: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait EventSink {
    fn write(&mut self, key: &str, data: Value);

    /// Cheap check so callers can skip building bulky event payloads when
    /// nothing is listening.
    fn enabled(&self) -> bool {
        true
    }
}

/// Discards every event. The default when persisted probability detail is
/// not needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn write(&mut self, _key: &str, _data: Value) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Appends one `{"key": ..., "data": ...}` object per line. Errors are
/// logged rather than propagated: losing an analysis event must not abort a
/// multi-day run.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlSink {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonlSink {
    fn write(&mut self, key: &str, data: Value) {
        let record = serde_json::json!({ "key": key, "data": data });
        if let Err(e) = writeln!(self.writer, "{record}").and_then(|_| self.writer.flush()) {
            log::warn!("failed to write event {key:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.write("round", serde_json::json!({"added": 3}));
            sink.write("correct", serde_json::json!(17));
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["key"], "round");
        assert_eq!(first["data"]["added"], 3);
    }

    #[test]
    fn null_sink_reports_disabled() {
        assert!(!NullSink.enabled());
    }
}
