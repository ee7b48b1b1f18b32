use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Request-level failures. Both are the sender's fault: answered with 400,
/// no sends attempted, nothing retried.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Malformed webhook payload: {0}")]
    MalformedInput(String),

    #[error("Unsupported webhook source")]
    UnsupportedPayload,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        warn!("Rejecting webhook: {}", self);
        let body = match &self {
            Self::MalformedInput(_) => "Malformed webhook payload",
            Self::UnsupportedPayload => "Unsupported webhook source",
        };
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}
