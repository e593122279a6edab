//! HTTP front door
//!
//! Requests for a project subdomain are dispatched by the invoker middleware;
//! every other host reaches the management API and health check.

pub mod api;
mod error;
mod middleware;

pub use api::{Owner, OWNER_HEADER};
pub use error::ApiError;

use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Result;
use crate::invoker::{ActionResolver, EngineConfig, InvocationEngine, InvokeError, ModuleCache};
use crate::repository::{ActionRepository, ProjectRepository};
use crate::sandbox::{Capabilities, SandboxRuntime};
use crate::storage::ModuleStorage;

/// Shared handles for handlers and middleware
#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<dyn ProjectRepository>,
    pub actions: Arc<dyn ActionRepository>,
    pub storage: Arc<dyn ModuleStorage>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub cache: Arc<ModuleCache>,
    pub resolver: Arc<ActionResolver>,
    pub engine: Arc<InvocationEngine>,
    pub module_bucket: String,
    pub capabilities: Capabilities,
    /// Flips to `true` when in-flight guest calls should be abandoned
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Wire the invoker together from configuration and collaborators
    pub fn new(
        config: &Config,
        projects: Arc<dyn ProjectRepository>,
        actions: Arc<dyn ActionRepository>,
        storage: Arc<dyn ModuleStorage>,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Result<Self> {
        let capabilities = config.sandbox.capabilities()?;
        let cache = Arc::new(match config.sandbox.cache_capacity {
            Some(capacity) => ModuleCache::with_capacity(capacity),
            None => ModuleCache::new(),
        });

        let resolver = Arc::new(ActionResolver::new(
            projects.clone(),
            actions.clone(),
            config.server.subdomain_offset,
        ));
        let engine = Arc::new(InvocationEngine::new(
            runtime.clone(),
            storage.clone(),
            cache.clone(),
            EngineConfig {
                module_bucket: config.storage.module_bucket.clone(),
                max_request_body: config.server.max_request_body,
                call_timeout: config.sandbox.call_timeout,
                capabilities: capabilities.clone(),
            },
        ));

        // Without a sender the receiver never reports a shutdown
        let (_, shutdown) = watch::channel(false);

        Ok(AppState {
            projects,
            actions,
            storage,
            runtime,
            cache,
            resolver,
            engine,
            module_bucket: config.storage.module_bucket.clone(),
            capabilities,
            shutdown,
        })
    }

    /// Cancel running guest calls when `shutdown` turns `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": crate::NAME,
        "version": crate::VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn fallback() -> InvokeError {
    InvokeError::RoutingNotFound
}

/// Build the application router.
///
/// The dispatch middleware wraps every route, including the fallback, so a
/// project subdomain never reaches the management API.
pub fn build_router(state: AppState, max_module_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api", api::router(max_module_bytes))
        .fallback(fallback)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::dispatch,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
