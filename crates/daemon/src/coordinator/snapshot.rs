//! Running-request snapshot on disk.
//!
//! Written with the temp-file-then-rename pattern so a reader sees either the
//! previous snapshot or the new one, never a partial write.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

use super::running::RunningRequest;
use crate::protocol::now_ms;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningSnapshot {
    pub schema_version: u32,
    pub saved_at: i64,
    pub requests: Vec<RunningRequest>,
}

pub fn save_snapshot(path: &Path, requests: Vec<RunningRequest>) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let snapshot = RunningSnapshot {
        schema_version: SCHEMA_VERSION,
        saved_at: now_ms(),
        requests,
    };
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a snapshot; a missing file is an empty snapshot.
pub fn load_snapshot(path: &Path) -> Result<Vec<RunningRequest>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let snapshot: RunningSnapshot = serde_json::from_slice(&bytes)?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }
    Ok(snapshot.requests)
}
