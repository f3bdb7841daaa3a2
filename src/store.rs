//! Cluster record storage

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use crate::record::ClusterRecord;
use crate::{Error, Result};

const STATE_FILE: &str = "state.toml";

/// Durable keyed storage for cluster records
pub trait RecordStore {
    /// Load a record, failing with [`Error::NotFound`] if absent
    fn load(&self, name: &str) -> Result<ClusterRecord>;
    fn save(&self, record: &ClusterRecord) -> Result<()>;
    /// Names of every stored cluster, sorted
    fn list(&self) -> Result<Vec<String>>;
    /// Remove a record; removing an absent record is not an error
    fn remove(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool> {
        match self.load(name) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// TOML records under `<root>/<name>/state.toml`
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.root.join(name).join(STATE_FILE)
    }
}

fn persistence(path: &Path, reason: impl ToString) -> Error {
    Error::Persistence {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl RecordStore for LocalStore {
    fn load(&self, name: &str) -> Result<ClusterRecord> {
        let path = self.state_file(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_string()))
            }
            Err(e) => return Err(persistence(&path, e)),
        };
        let record: ClusterRecord = toml::from_str(&contents).map_err(|e| persistence(&path, e))?;
        record.validate().map_err(|e| persistence(&path, e))?;
        Ok(record)
    }

    /// Replace the record atomically: a crash leaves either the old or the new file
    fn save(&self, record: &ClusterRecord) -> Result<()> {
        record.validate()?;
        let path = self.state_file(&record.name);
        let dir = self.root.join(&record.name);
        std::fs::create_dir_all(&dir).map_err(|e| persistence(&dir, e))?;

        let contents = toml::to_string_pretty(record).map_err(|e| persistence(&path, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| persistence(&dir, e))?;
        tmp.write_all(contents.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| persistence(&path, e))?;
        tmp.persist(&path).map_err(|e| persistence(&path, e.error))?;

        tracing::debug!(cluster = %record.name, state = %record.state, "Record saved");
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| persistence(&self.root, e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(STATE_FILE).is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.state_file(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(persistence(&path, e)),
        }
        let dir = self.root.join(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(persistence(&dir, e)),
        }
        tracing::debug!(cluster = %name, "Record removed");
        Ok(())
    }
}

/// In-process store for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<String, ClusterRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn load(&self, name: &str) -> Result<ClusterRecord> {
        self.records
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn save(&self, record: &ClusterRecord) -> Result<()> {
        record.validate()?;
        self.records.write().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.records.write().remove(name);
        Ok(())
    }
}
