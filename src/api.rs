use std::{sync::Arc, time::Duration};

use axum::Router;
use push_relay::SessionGate;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::PushConfig;

/// Limits applied to every stream connection.
#[derive(Debug, Clone)]
pub(crate) struct StreamOptions {
    pub max_message_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl From<&PushConfig> for StreamOptions {
    fn from(config: &PushConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub gate: Arc<SessionGate>,
    pub cancel: CancellationToken,
    pub stream: StreamOptions,
}

pub(crate) fn app_router(state: AppState) -> Router {
    Router::new()
        .merge(crate::handler::system::system_router())
        .merge(crate::handler::stream::stream_router())
        .with_state(state)
}

pub(crate) fn start_api_server(listener: TcpListener, state: AppState) -> JoinHandle<()> {
    let cancel = state.cancel.clone();
    let app = app_router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server error: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
