//! Invocation engine - runs a resolved action's module for one HTTP request
//!
//! Per call: cache lookup, on miss download and compile, fresh instance,
//! marshal request, call `handler`, translate the guest's response.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::cache::{CachedModule, ModuleCache};
use crate::error::Error;
use crate::model::Action;
use crate::protocol;
use crate::sandbox::{
    CallOutput, Capabilities, Instance, InstanceConfig, SandboxRuntime, ENTRY_POINT,
};
use crate::storage::ModuleStorage;

/// Why an invocation did not produce the guest's response.
///
/// Only the status code leaves the process; messages are for the log.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no action matches the request")]
    RoutingNotFound,

    #[error("action has no module")]
    ModuleNotImplemented,

    #[error("request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("failed to download module: {0}")]
    DownloadFailed(#[source] Error),

    #[error("failed to compile module: {0}")]
    CompileFailed(#[source] Error),

    #[error("failed to instantiate module: {0}")]
    InstantiateFailed(#[source] Error),

    #[error("guest call failed: {0}")]
    CallFailed(String),

    #[error("guest call cancelled")]
    CallCancelled,

    #[error("guest call exceeded {0:?}")]
    CallTimedOut(Duration),

    #[error("invalid guest response: {0}")]
    ProtocolError(String),

    #[error("lookup failed")]
    Internal,
}

impl InvokeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InvokeError::RoutingNotFound => StatusCode::NOT_FOUND,
            InvokeError::ModuleNotImplemented => StatusCode::NOT_IMPLEMENTED,
            InvokeError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for InvokeError {
    fn into_response(self) -> Response {
        self.status_code().into_response()
    }
}

/// Engine settings taken from the server, storage and sandbox sections
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub module_bucket: String,
    pub max_request_body: usize,
    pub call_timeout: Option<Duration>,
    /// Platform network policy; actions may only narrow it
    pub capabilities: Capabilities,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            module_bucket: "modules".to_string(),
            max_request_body: 8 * 1024 * 1024,
            call_timeout: None,
            capabilities: Capabilities::isolated(),
        }
    }
}

/// Logs if the request future is dropped while the guest is running
struct CallGuard<'a> {
    action: &'a Action,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                action_id = %self.action.id,
                project_id = %self.action.project_id,
                "Request dropped during guest call"
            );
        }
    }
}

pub struct InvocationEngine {
    runtime: Arc<dyn SandboxRuntime>,
    storage: Arc<dyn ModuleStorage>,
    cache: Arc<ModuleCache>,
    config: EngineConfig,
}

impl InvocationEngine {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        storage: Arc<dyn ModuleStorage>,
        cache: Arc<ModuleCache>,
        config: EngineConfig,
    ) -> Self {
        InvocationEngine {
            runtime,
            storage,
            cache,
            config,
        }
    }

    /// Run `action` for `request` until it completes or the caller drops it
    pub async fn invoke(&self, request: Request, action: &Action) -> Response {
        self.invoke_with_cancel(request, action, std::future::pending::<()>())
            .await
    }

    /// Like `invoke`, but the guest call also stops when `cancel` resolves
    pub async fn invoke_with_cancel<F>(&self, request: Request, action: &Action, cancel: F) -> Response
    where
        F: Future<Output = ()> + Send,
    {
        match self.execute(request, action, cancel).await {
            Ok(response) => response,
            Err(err) => {
                log_failure(&err, action);
                err.into_response()
            }
        }
    }

    async fn execute<F>(&self, request: Request, action: &Action, cancel: F) -> Result<Response, InvokeError>
    where
        F: Future<Output = ()> + Send,
    {
        if !action.has_module() {
            return Err(InvokeError::ModuleNotImplemented);
        }

        let input = self.marshal(request).await?;
        let cached = self.load(action).await?;

        let mut instance = cached
            .module
            .instantiate(&cached.config)
            .await
            .map_err(InvokeError::InstantiateFailed)?;

        let mut guard = CallGuard {
            action,
            armed: true,
        };
        let outcome = tokio::select! {
            outcome = self.call_guest(instance.as_mut(), &input) => outcome,
            _ = cancel => Err(InvokeError::CallCancelled),
        };
        guard.armed = false;

        translate(outcome?, action)
    }

    async fn call_guest(&self, instance: &mut dyn Instance, input: &[u8]) -> Result<CallOutput, InvokeError> {
        let call = instance.call(ENTRY_POINT, input);
        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(InvokeError::CallTimedOut(limit)),
            },
            None => call.await,
        };
        result.map_err(|e| InvokeError::CallFailed(e.to_string()))
    }

    /// Serialize the inbound request into the wire format
    async fn marshal(&self, request: Request) -> Result<Vec<u8>, InvokeError> {
        let limit = self.config.max_request_body;
        let (parts, body) = request.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(InvokeError::RequestTooLarge { limit });
        }
        // Also the error for bodies that fail mid-stream
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|_| InvokeError::RequestTooLarge { limit })?;

        let mut headers = protocol::Headers::new();
        for (name, value) in &parts.headers {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let wire = protocol::Request {
            url: full_url(&parts),
            method: parts.method.as_str().to_string(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        };

        wire.encode()
            .map_err(|e| InvokeError::ProtocolError(format!("failed to encode request: {}", e)))
    }

    /// Cached module for `action`, compiling it on a miss
    async fn load(&self, action: &Action) -> Result<CachedModule, InvokeError> {
        match self.cache.get(action.id).await {
            Some(cached) if cached.is_current(action.updated_at) => {
                debug!(action_id = %action.id, "Module cache hit");
                return Ok(cached);
            }
            Some(_) => debug!(action_id = %action.id, "Cached module is outdated"),
            None => {}
        }

        let ticket = self.cache.ticket(action.id).await;
        let bytes = self
            .storage
            .download(&self.config.module_bucket, &action.module_path)
            .await
            .map_err(InvokeError::DownloadFailed)?;

        let runtime = self.runtime.clone();
        let capabilities = self.capabilities_for(action);
        let module = tokio::task::spawn_blocking(move || runtime.compile(&bytes, &capabilities))
            .await
            .map_err(|e| InvokeError::CompileFailed(Error::Internal(e.to_string())))?
            .map_err(InvokeError::CompileFailed)?;

        let cached = CachedModule {
            module,
            config: InstanceConfig {
                envs: action.config.envs.clone(),
                args: action.config.args.clone(),
            },
            version: action.updated_at,
        };

        match self.cache.set(ticket, cached.clone()).await {
            Ok(true) => debug!(action_id = %action.id, "Compiled and cached module"),
            Ok(false) => debug!(action_id = %action.id, "Module replaced while compiling, not cached"),
            Err(e) => warn!(action_id = %action.id, error = %e, "Failed to cache compiled module"),
        }

        Ok(cached)
    }

    fn capabilities_for(&self, action: &Action) -> Capabilities {
        Capabilities {
            network_enabled: self.config.capabilities.network_enabled && action.config.network,
            allowed_addresses: self.config.capabilities.allowed_addresses.clone(),
        }
    }
}

/// Scheme, host, path and query of the inbound request
fn full_url(parts: &axum::http::request::Parts) -> String {
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

/// Turn a completed guest call into the HTTP response it describes
fn translate(output: CallOutput, action: &Action) -> Result<Response, InvokeError> {
    if !output.logs.is_empty() {
        debug!(action_id = %action.id, logs = %output.logs, "Guest stderr");
    }

    if output.exit_code != 0 {
        return Err(InvokeError::CallFailed(format!(
            "guest exited with code {}",
            output.exit_code
        )));
    }

    let wire = protocol::Response::decode(&output.output)
        .map_err(|e| InvokeError::ProtocolError(e.to_string()))?;

    let status = StatusCode::from_u16(wire.effective_status()).map_err(|_| {
        InvokeError::ProtocolError(format!("status code out of range: {}", wire.status_code))
    })?;

    let mut response = Response::new(Body::from(wire.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &wire.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| InvokeError::ProtocolError(format!("invalid header name: {:?}", name)))?;
        for value in values {
            let value = HeaderValue::from_str(value).map_err(|_| {
                InvokeError::ProtocolError(format!("invalid value for header {}", name))
            })?;
            headers.append(name.clone(), value);
        }
    }

    Ok(response)
}

fn log_failure(err: &InvokeError, action: &Action) {
    match err {
        InvokeError::CallCancelled => warn!(
            action_id = %action.id,
            project_id = %action.project_id,
            "Invocation cancelled"
        ),
        InvokeError::RequestTooLarge { .. } | InvokeError::ModuleNotImplemented => debug!(
            action_id = %action.id,
            project_id = %action.project_id,
            error = %err,
            "Invocation rejected"
        ),
        _ => error!(
            action_id = %action.id,
            project_id = %action.project_id,
            error = %err,
            "Invocation failed"
        ),
    }
}
