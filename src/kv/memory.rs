//! Process-local cache backend.

use super::KvStore;
use crate::Result;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// Cache entries held in a concurrent map; lost when the process exits.
///
/// Used when the engine has no storage directory, and in tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>, FxBuildHasher>,
}

impl MemoryKvStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes held.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut found: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        found.sort_unstable();
        Ok(found)
    }
}
