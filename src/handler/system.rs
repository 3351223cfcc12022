use axum::{Json, Router, extract::State, routing::get};
use push_relay::SessionSnapshot;

use crate::api::AppState;

pub fn system_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
}

async fn index() -> &'static str {
    "lite-push"
}

/// The active session, or `null` when nobody is streaming.
async fn status(State(state): State<AppState>) -> Json<Option<SessionSnapshot>> {
    Json(state.gate.snapshot().await)
}
