//! Durable blobs for the persistence boundary.
//!
//! Two things cross it: trained classifier stores (so training can be
//! decoupled from inference) and expansion state (so a multi-day snowball
//! run can resume after a crash). Both are opaque serde blobs; JSON keeps
//! them inspectable mid-run.
//!
//! Writes are write-then-rename: the new blob lands in a sibling temp file
//! and is atomically renamed over the destination, so a crash mid-write
//! leaves the previous valid checkpoint in place.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error on checkpoint {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} failed to (de)serialize: {source}")]
    Encoding {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value).map_err(|e| CheckpointError::Encoding {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        writer.flush().map_err(|e| io_err(&tmp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| CheckpointError::Encoding {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct State {
        round: u32,
        remaining: Vec<u32>,
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = State {
            round: 3,
            remaining: vec![5, 9, 12],
        };
        save_json(&path, &state).unwrap();
        let loaded: State = load_json(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn rewrite_replaces_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_json(&path, &State { round: 1, remaining: vec![1] }).unwrap();
        save_json(&path, &State { round: 2, remaining: vec![] }).unwrap();
        let loaded: State = load_json(&path).unwrap();
        assert_eq!(loaded.round, 2);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<State, _> = load_json(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(CheckpointError::Io { .. })));
    }
}
