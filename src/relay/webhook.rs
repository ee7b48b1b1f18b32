use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tracing::debug;

use crate::relay::{Relay, WebhookError, WebhookOutcome};

/// Shared application state
pub struct AppState {
    pub relay: Relay,
    pub version: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/webhook", post(webhook))
        .with_state(state)
}

async fn home(State(state): State<Arc<AppState>>) -> String {
    format!("Aura Bot is running on version {}", state.version)
}

/// Always 200 once the body is understood, whatever happens to the sends,
/// so platforms don't redeliver.
async fn webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, WebhookError> {
    match state.relay.handle(&body).await? {
        WebhookOutcome::Challenge(challenge) => Ok((StatusCode::OK, challenge).into_response()),
        WebhookOutcome::Suppressed => Ok(StatusCode::OK.into_response()),
        WebhookOutcome::Relayed { delivered } => {
            debug!("Relayed to {}/2 destinations", delivered);
            Ok(StatusCode::OK.into_response())
        }
    }
}
