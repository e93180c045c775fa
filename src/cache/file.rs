//! File-backed cache: one JSON object per user under a directory.

use super::{CacheError, LocalCache};
use crate::domain::UserId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileCache {
    /// Open (and create if needed) a cache directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!("Local cache opened at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, user_id: &UserId) -> PathBuf {
        // User ids are arbitrary strings; hex keeps them filesystem-safe.
        self.dir
            .join(format!("{}.json", hex::encode(user_id.as_str().as_bytes())))
    }

    fn read_all(&self, user_id: &UserId) -> Result<BTreeMap<String, String>, CacheError> {
        let path = self.path_for(user_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(
        &self,
        user_id: &UserId,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(entries)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl LocalCache for FileCache {
    fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.read_all(user_id)?.remove(key))
    }

    fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_all(user_id)?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(user_id, &entries)
    }

    fn remove(&self, user_id: &UserId, key: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_all(user_id)?;
        if entries.remove(key).is_some() {
            self.write_all(user_id, &entries)?;
        }
        Ok(())
    }
}
