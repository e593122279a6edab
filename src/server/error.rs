//! Management API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::error::Error;

/// Crate error rendered as a JSON body; 5xx details stay in the log
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError(Error::NotFound(what.into()))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError(Error::InvalidInput(message.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!(error = %self.0, "Management API request failed");
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let response = ApiError(Error::Storage("disk /dev/sda1 full".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("sda1"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::bad_request("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError(Error::Unauthorized("x".into())).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
