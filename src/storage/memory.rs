//! In-memory blob storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::ModuleStorage;
use crate::error::{Error, Result};

/// Process-local object store keyed by `(bucket, path)`
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    downloads: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful downloads served so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModuleStorage for MemoryStorage {
    async fn upload(&self, bucket: &str, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), path.to_string()), data.to_vec());
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let data = self
            .objects
            .read()
            .await
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {}/{}", bucket, path)))?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        self.objects
            .write()
            .await
            .remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buckets_are_separate() {
        let storage = MemoryStorage::new();
        storage.upload("a", "m.wasm", b"one").await.unwrap();
        assert!(storage.download("b", "m.wasm").await.is_err());
        assert_eq!(storage.download("a", "m.wasm").await.unwrap(), b"one");
        assert_eq!(storage.download_count(), 1);
    }
}
