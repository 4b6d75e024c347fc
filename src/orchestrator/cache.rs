//! Result cache: run configuration → final result file name.
//!
//! Entries are only ever inserted if absent; a run never overwrites a result
//! another run already stored for the same configuration.

use crate::error::StoreError;
use crate::model::{RunConfiguration, OUTPUT_KEY};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persistence backend for [`ResultCache`]. Implementations serialize
/// access internally so one store can be shared by concurrent runs.
pub trait CacheStore: Send + Sync {
    fn find(&self, key: &RunConfiguration) -> Result<Option<String>, StoreError>;

    /// Returns `false` when an entry already exists; the stored file is kept.
    fn insert_if_absent(&self, key: &RunConfiguration, file: &str) -> Result<bool, StoreError>;

    fn remove(&self, key: &RunConfiguration) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<RunConfiguration, String>>,
}

impl CacheStore for MemoryStore {
    fn find(&self, key: &RunConfiguration) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert_if_absent(&self, key: &RunConfiguration, file: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), file.to_string());
        Ok(true)
    }

    fn remove(&self, key: &RunConfiguration) -> Result<bool, StoreError> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

/// JSON-lines file of `{..params, "_analysis": id, "_yoda": file}` documents.
///
/// The file is read once on open; inserts append, removals rewrite it.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<RunConfiguration, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let mut entries = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
                .map_err(|source| StoreError::Document {
                    line: idx + 1,
                    source,
                })?;
            match RunConfiguration::from_document(doc) {
                // First document for a key wins, as with inserts.
                Some((key, file)) => {
                    entries.entry(key).or_insert(file);
                }
                None => tracing::warn!(line = idx + 1, "cache document without reserved keys skipped"),
            }
        }
        tracing::debug!(path = %path.display(), entries = entries.len(), "cache loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn document_line(key: &RunConfiguration, file: &str) -> String {
        let mut doc = key.to_document();
        doc.insert(OUTPUT_KEY.into(), file.into());
        serde_json::Value::Object(doc).to_string()
    }

    fn append(&self, line: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(f, "{line}").map_err(|e| self.io_err(e))
    }

    fn rewrite(&self, entries: &HashMap<RunConfiguration, String>) -> Result<(), StoreError> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_err(e))?;
        for (key, file) in entries {
            writeln!(tmp, "{}", Self::document_line(key, file)).map_err(|e| self.io_err(e))?;
        }
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }
}

impl CacheStore for JsonFileStore {
    fn find(&self, key: &RunConfiguration) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert_if_absent(&self, key: &RunConfiguration, file: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        self.append(&Self::document_line(key, file))?;
        entries.insert(key.clone(), file.to_string());
        Ok(true)
    }

    fn remove(&self, key: &RunConfiguration) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let Some(file) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.rewrite(&entries) {
            entries.insert(key.clone(), file);
            return Err(e);
        }
        Ok(true)
    }
}

/// Shared handle on a [`CacheStore`].
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache").finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// Persistent cache at `path`, or in memory when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        match path {
            Some(p) => Ok(Self::new(Arc::new(JsonFileStore::open(p)?))),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn exists(&self, key: &RunConfiguration) -> Result<bool, StoreError> {
        Ok(self.store.find(key)?.is_some())
    }

    pub fn get(&self, key: &RunConfiguration) -> Result<Option<String>, StoreError> {
        self.store.find(key)
    }

    pub fn add(&self, key: &RunConfiguration, file: &str) -> Result<bool, StoreError> {
        let inserted = self.store.insert_if_absent(key, file)?;
        if inserted {
            tracing::info!(analysis = %key.analysis, file, "result cached");
        } else {
            tracing::debug!(analysis = %key.analysis, file, "cache entry already present");
        }
        Ok(inserted)
    }

    pub fn remove(&self, key: &RunConfiguration) -> Result<bool, StoreError> {
        self.store.remove(key)
    }
}
