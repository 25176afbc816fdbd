use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use polygate::config::{ConfigStore, watcher};
use polygate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    polygate::logging::init();

    let config_path = std::env::var("POLYGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ConfigStore::default_path());
    let store = Arc::new(ConfigStore::open(config_path)?);

    // Must stay alive for the watch registration to hold.
    let _watcher = watcher::spawn(store.clone())?;

    let state = AppState::new(store);
    let app = polygate::build_app(state.clone());

    let listen_addr = std::env::var("LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Server running on {listen_addr}");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {},
                _ = tokio::signal::ctrl_c() => {},
            }
            info!("shutting down");
        })
        .await?;

    Ok(())
}
