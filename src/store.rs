use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::db::SqliteBackend;
use crate::settings::{StateBackendKind, StateConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize seen items for {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sqlite state error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Durable storage for the seen-identifier set.
///
/// `save` must replace the previous contents atomically: a reader never sees a
/// half-written state.
pub trait StateBackend: Send {
    fn load(&self) -> Result<HashSet<String>, StoreError>;
    fn save(&self, ids: &HashSet<String>) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

/// Identifiers already reported as new, shared by all targets.
///
/// Only grows. Membership is the sole test for "new".
pub struct SeenItemStore {
    ids: HashSet<String>,
    backend: Box<dyn StateBackend>,
}

impl SeenItemStore {
    /// Read persisted state. Missing state is an empty set; corrupt state is an error.
    pub fn load(backend: Box<dyn StateBackend>) -> Result<Self, StoreError> {
        let ids = backend.load()?;
        info!(count = ids.len(), backend = %backend.describe(), "Loaded seen items");
        Ok(Self { ids, backend })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns `true` if `id` was not present before.
    pub fn add(&mut self, id: String) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Write the full set to durable storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.save(&self.ids)?;
        debug!(count = self.ids.len(), "Flushed seen items");
        Ok(())
    }
}

/// Build the configured backend and load it.
pub fn open(cfg: &StateConfig) -> Result<SeenItemStore, StoreError> {
    let backend: Box<dyn StateBackend> = match cfg.backend {
        StateBackendKind::Json => Box::new(JsonFileBackend::new(&cfg.path)),
        StateBackendKind::Sqlite => Box::new(SqliteBackend::open(&cfg.path)?),
    };
    SeenItemStore::load(backend)
}

// ── JSON file ──

/// A JSON array of identifier strings, sorted so rewrites diff cleanly.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "seen_items.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<HashSet<String>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        let ids: Vec<String> = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(ids.into_iter().collect())
    }

    fn save(&self, ids: &HashSet<String>) -> Result<(), StoreError> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        let body = serde_json::to_string_pretty(&sorted).map_err(|source| StoreError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        // Write a sibling file and rename it over the target.
        let tmp = self.tmp_path();
        write_synced(&tmp, body.as_bytes()).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

// ── In-memory ──
