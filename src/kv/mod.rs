//! Storage behind the result cache.
//!
//! Cache artifacts are opaque byte blobs under string keys. [`KvStore`] is
//! the async seam; [`MemoryKvStore`] and [`FileKvStore`] implement it and
//! [`CacheBackend`] selects between them from [`EngineConfig`].

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use crate::config::EngineConfig;
use crate::Result;
use std::future::Future;

/// Async byte store keyed by string.
pub trait KvStore: Send + Sync {
    /// Value under `key`, if any.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store `value` under `key`, replacing what was there.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Remove `key`; absent keys are not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Whether `key` is present.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Values for several keys, in key order.
    fn batch_get(
        &self,
        keys: &[&str],
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }

    /// Store several entries, in order.
    fn batch_set(&self, pairs: Vec<(&str, Vec<u8>)>) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in pairs {
                self.set(key, value).await?;
            }
            Ok(())
        }
    }
}

/// Store selected from configuration.
#[derive(Debug)]
pub enum CacheBackend {
    /// Process memory
    Memory(MemoryKvStore),
    /// Files under a directory
    File(FileKvStore),
}

impl CacheBackend {
    /// File backend under the configured cache directory, or memory when
    /// no storage directory is set.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be created.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(match config.cache_dir() {
            Some(dir) => Self::File(FileKvStore::open(dir)?),
            None => Self::Memory(MemoryKvStore::new()),
        })
    }
}

impl Default for CacheBackend {
    fn default() -> Self {
        Self::Memory(MemoryKvStore::new())
    }
}

impl KvStore for CacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(s) => s.get(key).await,
            Self::File(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self {
            Self::Memory(s) => s.set(key, value).await,
            Self::File(s) => s.set(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(s) => s.delete(key).await,
            Self::File(s) => s.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(s) => s.exists(key).await,
            Self::File(s) => s.exists(key).await,
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Self::Memory(s) => s.keys(prefix).await,
            Self::File(s) => s.keys(prefix).await,
        }
    }
}
