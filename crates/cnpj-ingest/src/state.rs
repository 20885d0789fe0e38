//! Persisted pipeline run state
//!
//! `run_state.json` records, per archive, how far through the pipeline it
//! got and what came out of each of its parts. A re-invoked run loads the
//! file and resumes: completed downloads are not re-fetched, converted
//! shards are not re-scanned, published tables are not rebuilt.
//!
//! The state handle is the only cross-worker shared mutable state in the
//! pipeline. All mutation goes through [`StateStore::update`], which holds
//! the lock for the duration of the change and persists atomically
//! (temp file + rename) before returning, giving single-writer discipline
//! per archive key even with concurrent workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How far through the pipeline an archive has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStage {
    Pending,
    Downloaded,
    Converted,
    Failed,
}

/// Conversion outcome for one extracted part (one shard)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartRecord {
    /// Inner part file name, preserved from the archive
    pub name: String,
    /// Staged shard file name under the staged directory, when conversion
    /// succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged: Option<String>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_malformed: u64,
    pub rows_deduped: u64,
    /// Present when the shard was excluded (corrupt data, threshold hit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-archive pipeline progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub url: String,
    /// Canonical logical-table name the archive contributes to
    pub table: String,
    pub stage: ArchiveStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub parts: Vec<PartRecord>,
}

impl ArchiveRecord {
    pub fn new(url: String, table: String) -> Self {
        Self {
            url,
            table,
            stage: ArchiveStage::Pending,
            size: None,
            sha256: None,
            error: None,
            parts: Vec::new(),
        }
    }
}

/// Published-table bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    /// Artifact file name inside the table store
    pub artifact: String,
    pub rows_written: u64,
    pub rows_deduped: u64,
    pub shards_merged: usize,
    pub published_at: DateTime<Utc>,
}

/// Whole-run state, serialized to `run_state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub state_version: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by archive file name
    #[serde(default)]
    pub archives: BTreeMap<String, ArchiveRecord>,
    /// Keyed by canonical table name
    #[serde(default)]
    pub tables: BTreeMap<String, TableRecord>,
}

impl RunState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            state_version: 1,
            started_at: now,
            updated_at: now,
            archives: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex-guarded, persistently backed run state
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<RunState>,
}

impl StateStore {
    /// Load the state file, or start fresh if none exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RunState::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Read access under the lock
    pub fn with<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutate and persist atomically; the lock is held until the state file
    /// has been renamed into place
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut guard);
        guard.updated_at = Utc::now();
        persist(&self.path, &guard)?;
        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persist(path: &Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
