//! Sandbox module - isolated execution of guest WebAssembly modules
//!
//! The lifecycle is split in three steps so the expensive part is paid once:
//! - `SandboxRuntime::compile`: raw bytes to a reusable `CompiledModule`
//! - `CompiledModule::instantiate`: a fresh, disposable `Instance` per call
//! - `Instance::call`: run an exported entry point with input bytes

mod capabilities;
pub mod net;
mod wasm;

pub use capabilities::{AddressPattern, AddressPolicy, Capabilities, InstanceConfig};
pub use wasm::{WasmtimeRuntime, HOST_MODULE};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Name of the guest export invoked for every request
pub const ENTRY_POINT: &str = "handler";

/// Outcome of a guest call that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOutput {
    /// Zero on success
    pub exit_code: i32,
    /// Bytes the guest produced as its result
    pub output: Vec<u8>,
    /// Diagnostic text the guest wrote to stderr
    pub logs: String,
}

/// Compiles module bytes into reusable handles
pub trait SandboxRuntime: Send + Sync {
    /// Compile `bytes` into a module bound to `capabilities`.
    ///
    /// CPU-bound; callers on an async runtime should run it on the blocking pool.
    fn compile(&self, bytes: &[u8], capabilities: &Capabilities) -> Result<Arc<dyn CompiledModule>>;
}

/// A compiled module, shareable across concurrent calls
#[async_trait]
pub trait CompiledModule: Send + Sync {
    /// Whether the module exports a callable function named `name`
    fn has_entry_point(&self, name: &str) -> bool;

    /// Create a fresh instance; instances are never reused
    async fn instantiate(&self, config: &InstanceConfig) -> Result<Box<dyn Instance>>;
}

/// A single-use execution of a compiled module
#[async_trait]
pub trait Instance: Send {
    /// Invoke `entry_point` with `input`.
    ///
    /// Errors mean the call did not complete (trap, resource limit, missing
    /// export); a guest that reports failure does so through `exit_code`.
    async fn call(&mut self, entry_point: &str, input: &[u8]) -> Result<CallOutput>;
}
