//! # wasmgate
//!
//! A multi-tenant platform running WebAssembly modules as HTTP-triggered
//! functions.
//!
//! ## Features
//!
//! - **Subdomain routing:** `{project}.example.com/path` resolves to a project's action
//! - **Compiled module cache:** each module is compiled once and instantiated per request
//! - **Sandboxed execution:** Wasmtime with WASI preview1, memory and output limits
//! - **JSON wire protocol:** the HTTP request goes in, a status/headers/body response comes out
//! - **Management API:** projects, actions and module uploads under `/api`

pub mod config;
pub mod error;
pub mod invoker;
pub mod model;
pub mod protocol;
pub mod repository;
pub mod sandbox;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
