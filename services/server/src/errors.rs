//! Error kinds surfaced by the dispatcher (spec §7). Each maps to a fixed
//! HTTP status and body, never leaks internals to the public caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("no proxy client connected")]
    NoClientAvailable,
    #[error("proxy client timed out")]
    Timeout,
}

impl DispatchError {
    /// Whether to suppress the body per spec §4.3 step 1 (`HEAD`/`OPTIONS`
    /// under `401` get an empty body).
    pub fn into_response_for(self, method: &axum::http::Method) -> Response {
        let (status, message) = match self {
            DispatchError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            DispatchError::NoClientAvailable => (StatusCode::SERVICE_UNAVAILABLE, "No proxy client"),
            DispatchError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Proxy client timeout"),
        };
        let body = if status == StatusCode::UNAUTHORIZED
            && matches!(*method, axum::http::Method::HEAD | axum::http::Method::OPTIONS)
        {
            String::new()
        } else {
            message.to_owned()
        };
        (status, body).into_response()
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        self.into_response_for(&axum::http::Method::GET)
    }
}
