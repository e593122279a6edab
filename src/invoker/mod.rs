//! Invoker - dispatches subdomain requests to sandboxed action modules
//!
//! - route.rs: path patterns attached to actions
//! - resolver.rs: host/path/method to project and action
//! - cache.rs: compiled modules keyed by action id
//! - engine.rs: download, compile, instantiate, call, translate

mod cache;
mod engine;
mod resolver;
mod route;

pub use cache::{CachedModule, FillTicket, ModuleCache};
pub use engine::{EngineConfig, InvocationEngine, InvokeError};
pub use resolver::{extract_subdomain, ActionResolver, Resolution};
pub use route::RoutePattern;
