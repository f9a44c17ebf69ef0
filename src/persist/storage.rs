//! Durable Storage
//!
//! A key-value byte store holding the persisted cache blob.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{CacheError, CacheResult};

pub trait DurableStorage: Send + Sync {
    fn load(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Replace the value under `key`
    fn store(&self, key: &str, bytes: &[u8]) -> CacheResult<()>;

    fn remove(&self, key: &str) -> CacheResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStorage for MemoryStorage {
    fn load(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &str) -> CacheResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(CacheError::InvalidInput(format!("invalid storage key `{}`", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl DurableStorage for FileStorage {
    fn load(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match fs::read(self.path(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Written to a sibling temp file first, then renamed over the target
    fn store(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CacheError::Storage(format!("{}: {}", path.display(), e))
        })
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.path(key)?) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_overwrites_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("cache")).unwrap();

        assert!(storage.load("budget-cache").unwrap().is_none());
        storage.store("budget-cache", b"one").unwrap();
        storage.store("budget-cache", b"two").unwrap();
        assert_eq!(storage.load("budget-cache").unwrap().unwrap(), b"two");
        assert!(!dir.path().join("cache/budget-cache.json.tmp").exists());

        storage.remove("budget-cache").unwrap();
        storage.remove("budget-cache").unwrap();
        assert!(storage.load("budget-cache").unwrap().is_none());
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(matches!(storage.store("../escape", b"x"), Err(CacheError::InvalidInput(_))));
        assert!(storage.path("").is_err());
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.store("k", b"v").unwrap();
        assert_eq!(storage.load("k").unwrap().unwrap(), b"v");
        storage.remove("k").unwrap();
        assert!(storage.load("k").unwrap().is_none());
    }
}
