//! Blob storage for module bytes
//!
//! Modules are addressed by `(bucket, path)`. The invoker only downloads;
//! uploads and deletes come from the management API.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::error::Result;

/// Abstract interface for module blob storage
#[async_trait]
pub trait ModuleStorage: Send + Sync {
    /// Store bytes at `path`, replacing any previous object
    async fn upload(&self, bucket: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Fetch the bytes stored at `path`
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>>;

    /// Remove the object at `path`; missing objects are not an error
    async fn delete(&self, bucket: &str, path: &str) -> Result<()>;
}
