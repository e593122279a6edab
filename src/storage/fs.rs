//! Filesystem blob storage, one directory per bucket

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::ModuleStorage;
use crate::error::{Error, Result};

/// Stores objects under `{root}/{bucket}/{path}`
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStorage { root: root.into() }
    }

    /// Resolve an object location, rejecting anything that could escape the root
    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for part in [bucket, path] {
            let part = Path::new(part);
            if part.as_os_str().is_empty() {
                return Err(Error::InvalidInput("empty bucket or object path".into()));
            }
            for component in part.components() {
                match component {
                    Component::Normal(segment) => resolved.push(segment),
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "invalid object path: {}",
                            part.display()
                        )))
                    }
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ModuleStorage for FsStorage {
    async fn upload(&self, bucket: &str, path: &str, data: &[u8]) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a partial module
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!(bucket, path, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let target = self.object_path(bucket, path)?;
        tokio::fs::read(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("object {}/{}", bucket, path))
            } else {
                Error::Storage(format!("read {}/{}: {}", bucket, path, e))
            }
        })
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {}/{}: {}", bucket, path, e))),
        }
    }
}
