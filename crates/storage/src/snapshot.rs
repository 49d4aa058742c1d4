// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic run-directory snapshot persistence: write to `.tmp`, fsync,
//! rename. A crash mid-write never leaves a corrupt `run.json`.

use chrono::{DateTime, Utc};
use meow_core::Run;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub written_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            written_at: Utc::now(),
        }
    }

    /// Write atomically: serialize to `<path>.tmp`, fsync, then
    /// rename over `path`. Logs and returns the error on failure; the
    /// caller is expected to treat a failed snapshot as non-fatal to
    /// the run itself.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self)?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meow_core::id::RunId;
    use std::collections::HashMap;

    #[test]
    fn round_trips_through_atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let run = Run::new(RunId::new("run-ab-12345678"), "main", HashMap::new());
        let snapshot = RunSnapshot::new(run);
        snapshot.save(&path).unwrap();

        let loaded = RunSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.run.id, snapshot.run.id);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(RunSnapshot::load(&path).unwrap().is_none());
    }

    #[test]
    fn no_tmp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let run = Run::new(RunId::new("run-ab-12345678"), "main", HashMap::new());
        RunSnapshot::new(run).save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
