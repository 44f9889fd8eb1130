use crate::protocol::error_shapes::anthropic_error_payload;
use crate::stream::TranslateError;

/// Error type used across the proxy outside the streaming core.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol translation error: {0}")]
    Translation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Overloaded,
    ServerError,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::RateLimit,
        503 | 529 => ErrorCategory::Overloaded,
        _ => ErrorCategory::ServerError,
    }
}

impl BridgeError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            BridgeError::Config(_)
            | BridgeError::Transport(_)
            | BridgeError::Translation(_)
            | BridgeError::Internal(_) => ErrorCategory::ServerError,
            BridgeError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code
// ---------------------------------------------------------------------------

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Overloaded => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Format an error as a Messages-API error, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &BridgeError) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let status = http_status_for_category(cat);
    (status, anthropic_error_payload(cat, &err.to_string()))
}

impl From<TranslateError> for BridgeError {
    fn from(err: TranslateError) -> Self {
        BridgeError::Translation(err.to_string())
    }
}

impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
