use std::sync::Arc;

use push_relay::{CommandSpawner, SessionGate};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("lite_push", log::LevelFilter::Debug)
        .filter_module("push_relay", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::load()?;

    let profile = config.encoder_profile();
    log::info!(
        "Encoder: {} {}",
        profile.program.display(),
        profile.args.join(" ")
    );
    let spawner = Arc::new(CommandSpawner::new(profile));
    let gate = Arc::new(SessionGate::new(spawner, config.relay_policy()));

    let cancel = CancellationToken::new();
    let listener = TcpListener::bind(&config.listen).await?;
    log::info!("API server started on {}", listener.local_addr()?);
    let server = api::start_api_server(
        listener,
        api::AppState {
            gate: Arc::clone(&gate),
            cancel: cancel.clone(),
            stream: config.into(),
        },
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    gate.shutdown().await;
    if let Err(e) = server.await {
        log::error!("API server task failed: {}", e);
    }
    Ok(())
}
