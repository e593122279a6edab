//! Subdomain dispatch ahead of ordinary routing

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::invoker::{InvokeError, Resolution};

/// Hand project-subdomain requests to the invoker; everything else continues
/// to the router
pub async fn dispatch(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();

    let resolution = state
        .resolver
        .resolve(&host, request.uri().path(), request.method())
        .await;

    match resolution {
        Resolution::Passthrough => next.run(request).await,
        Resolution::NotFound => InvokeError::RoutingNotFound.into_response(),
        Resolution::NotImplemented { .. } => InvokeError::ModuleNotImplemented.into_response(),
        Resolution::InternalError => InvokeError::Internal.into_response(),
        Resolution::Matched { action, .. } => {
            let mut shutdown = state.shutdown.clone();
            let cancelled = async move {
                // A dropped sender means the server never asks for cancellation
                let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
                if !requested {
                    std::future::pending::<()>().await;
                }
            };
            state
                .engine
                .invoke_with_cancel(request, &action, cancelled)
                .await
        }
    }
}
