use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::store::ConfigStore;
use crate::error::AppError;

const QUIESCENCE: Duration = Duration::from_millis(500);

/// Watches the config file for external changes and reloads the store once
/// events have been quiet for at least 500 ms. The returned watcher must be
/// kept alive for the watch to stay registered.
pub fn spawn(store: Arc<ConfigStore>) -> Result<RecommendedWatcher, AppError> {
    let config_path = store.path().to_path_buf();
    let watch_dir = config_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let event_path = config_path.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) if is_config_event(&event, &event_path) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("config watcher error: {e}"),
        }
    })
    .map_err(|e| AppError::Internal(format!("failed to create file watcher: {e}")))?;

    // Watch the directory rather than the file so create/rename (the atomic
    // save path) keeps being observed.
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| AppError::Internal(format!("failed to watch config dir: {e}")))?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            loop {
                match tokio::time::timeout(QUIESCENCE, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            debug!("config file changed, reloading");
            if let Err(e) = store.reload_from_disk() {
                warn!("config reload failed: {e}");
            }
        }
    });

    Ok(watcher)
}

fn is_config_event(event: &Event, config_path: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|p| p == config_path)
}
