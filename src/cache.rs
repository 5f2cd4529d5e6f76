//! Local fallback cache mirroring the last known file list.
//!
//! The cache is not authoritative. It is only read when the live listing fails, so it can
//! drift from what the server holds.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_info::FileRecord;

/// Key under which the whole file list is stored.
pub const FILES_KEY: &str = "files";

/// String key-value persistence, the role browser local storage plays.
pub trait KeyValueStore: Debug + Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// A JSON object on disk. Every write replaces the file atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> FileStore {
        FileStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Decode(format!("store {}: {}", self.path.display(), e)))
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string(map)
            .map_err(|e| Error::Decode(format!("store {}: {}", self.path.display(), e)))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value);
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FallbackCache {
    store: Arc<dyn KeyValueStore>,
}

impl FallbackCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> FallbackCache {
        FallbackCache { store }
    }

    pub fn in_memory() -> FallbackCache {
        FallbackCache::new(Arc::new(MemoryStore::new()))
    }

    pub fn on_disk(path: impl Into<PathBuf>) -> FallbackCache {
        FallbackCache::new(Arc::new(FileStore::new(path)))
    }

    /// The cache the config points at: on disk when `cache_file` is set, otherwise in memory.
    pub fn for_config(config: &Config) -> FallbackCache {
        match &config.cache_file {
            Some(path) => FallbackCache::on_disk(path),
            None => FallbackCache::in_memory(),
        }
    }

    pub fn load_all(&self) -> Result<Vec<FileRecord>> {
        match self.store.get(FILES_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Decode(format!("cached file list: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Insert or overwrite the record with the same name.
    pub fn save(&self, record: &FileRecord) -> Result<()> {
        let mut records = self.load_all()?;
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write(&records)
    }

    /// Returns whether a record was removed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut records = self.load_all()?;
        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.write(&records)?;
        Ok(true)
    }

    pub fn replace_all(&self, records: &[FileRecord]) -> Result<()> {
        self.write(records)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(FILES_KEY)
    }

    fn write(&self, records: &[FileRecord]) -> Result<()> {
        let raw = serde_json::to_string(records)
            .map_err(|e| Error::Decode(format!("cached file list: {}", e)))?;
        self.store.set(FILES_KEY, raw)
    }
}
