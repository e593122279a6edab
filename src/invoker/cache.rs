//! Compiled module cache
//!
//! Uses moka's async cache. Entries live until an upload, replacement or
//! delete removes them; an optional capacity bound evicts least-recently
//! used modules.
//!
//! Filling is two-phase. A caller takes a [`FillTicket`] before it downloads
//! the module and hands it back to [`ModuleCache::set`]. Any removal in
//! between invalidates the ticket, so a compile of bytes that were replaced
//! mid-flight never lands in the cache.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::sandbox::{CompiledModule, InstanceConfig};

/// A compiled module ready to be instantiated
#[derive(Clone)]
pub struct CachedModule {
    pub module: Arc<dyn CompiledModule>,
    pub config: InstanceConfig,
    /// `updated_at` of the action the module was compiled for
    pub version: DateTime<Utc>,
}

impl CachedModule {
    /// Whether this entry was built from the action's current module and settings
    pub fn is_current(&self, updated_at: DateTime<Utc>) -> bool {
        self.version == updated_at
    }
}

/// Proof that no removal happened since a fill started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    action_id: Uuid,
    generation: u64,
}

impl std::fmt::Debug for CachedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModule")
            .field("config", &self.config)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Action id to compiled module
#[derive(Clone)]
pub struct ModuleCache {
    modules: Cache<Uuid, CachedModule>,
    /// Bumped by every removal; held across check-and-insert
    generation: Arc<Mutex<u64>>,
}

impl ModuleCache {
    /// Unbounded cache
    pub fn new() -> Self {
        Self::from_cache(Cache::builder().build())
    }

    /// Cache holding at most `capacity` modules
    pub fn with_capacity(capacity: u64) -> Self {
        Self::from_cache(Cache::builder().max_capacity(capacity).build())
    }

    fn from_cache(modules: Cache<Uuid, CachedModule>) -> Self {
        ModuleCache {
            modules,
            generation: Arc::new(Mutex::new(0)),
        }
    }

    pub async fn get(&self, action_id: Uuid) -> Option<CachedModule> {
        self.modules.get(&action_id).await
    }

    /// Start a fill for `action_id`; take it before reading the module blob
    pub async fn ticket(&self, action_id: Uuid) -> FillTicket {
        FillTicket {
            action_id,
            generation: *self.generation.lock().await,
        }
    }

    /// Store a compiled module, replacing any previous entry.
    ///
    /// Returns `false` without storing when a removal happened after
    /// `ticket` was taken.
    pub async fn set(&self, ticket: FillTicket, entry: CachedModule) -> Result<bool> {
        let generation = self.generation.lock().await;
        if *generation != ticket.generation {
            return Ok(false);
        }
        self.modules.insert(ticket.action_id, entry).await;
        Ok(true)
    }

    /// Drop the entry of an action and void outstanding tickets; absent
    /// entries are fine
    pub async fn remove(&self, action_id: Uuid) -> Result<()> {
        let mut generation = self.generation.lock().await;
        *generation = generation.wrapping_add(1);
        self.modules.invalidate(&action_id).await;
        Ok(())
    }

    /// Approximate number of entries
    pub fn len(&self) -> u64 {
        self.modules.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}
