// src/snapshot.rs
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::attendance_book::ChangeEvent;
use crate::models::{AttendanceMember, AttendanceRecord, AttendanceReport};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_context<S: Into<String>>(source: std::io::Error, context: S) -> SnapshotError {
    SnapshotError::Io {
        source,
        context: context.into(),
    }
}

/// Full contents of an attendance book, as written to disk and as pulled
/// from the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    #[serde(default)]
    pub members: Vec<AttendanceMember>,
    #[serde(default)]
    pub records: Vec<AttendanceRecord>,
    #[serde(default)]
    pub reports: Vec<AttendanceReport>,
    /// Local changes the backend has not acknowledged yet. Never part of a
    /// pulled copy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<ChangeEvent>,
}

impl BookSnapshot {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
            && self.records.is_empty()
            && self.reports.is_empty()
            && self.pending.is_empty()
    }
}

/// Clones share one write lock, so saves from the snapshot writer and the
/// synchronizer never interleave.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file loads as an empty snapshot.
    pub fn load(&self) -> Result<BookSnapshot, SnapshotError> {
        if !self.path.exists() {
            info!(
                "No snapshot at {:?}, starting with an empty attendance book",
                self.path
            );
            return Ok(BookSnapshot::default());
        }
        let json = fs::read_to_string(&self.path)
            .map_err(|e| io_context(e, format!("Failed to read snapshot: {:?}", self.path)))?;
        let snapshot: BookSnapshot = serde_json::from_str(&json)?;
        info!(
            "Loaded snapshot from {:?}: {} members, {} records, {} reports",
            self.path,
            snapshot.members.len(),
            snapshot.records.len(),
            snapshot.reports.len()
        );
        Ok(snapshot)
    }

    /// Sibling temp file, unique per write.
    fn temp_path(&self) -> PathBuf {
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", file_name, suffix))
    }

    /// Writes to a sibling temp file first, then renames it into place.
    /// Blocking; call it from `spawn_blocking` inside async tasks.
    pub fn save(&self, snapshot: &BookSnapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                io_context(e, format!("Failed to create snapshot directory: {:?}", parent))
            })?;
        }
        let tmp_path = self.temp_path();
        fs::write(&tmp_path, json)
            .map_err(|e| io_context(e, format!("Failed to write snapshot: {:?}", tmp_path)))?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_context(
                e,
                format!("Failed to move snapshot into place: {:?}", self.path),
            ));
        }
        debug!("Saved snapshot to {:?}", self.path);
        Ok(())
    }
}
