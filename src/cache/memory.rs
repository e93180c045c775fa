use super::{CacheError, LocalCache};
use crate::domain::UserId;
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local cache backed by a map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(UserId, String), String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(UserId, String), String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .entries()
            .get(&(user_id.clone(), key.to_string()))
            .cloned())
    }

    fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries()
            .insert((user_id.clone(), key.to_string()), value.to_string());
        Ok(())
    }

    fn remove(&self, user_id: &UserId, key: &str) -> Result<(), CacheError> {
        self.entries().remove(&(user_id.clone(), key.to_string()));
        Ok(())
    }
}
