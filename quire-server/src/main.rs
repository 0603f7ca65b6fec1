//! quire-server: serves collaborative editing rooms over WebSocket for the
//! files beneath `QUIRE_ROOT`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use quire_collab::{
    CollabConfig, DocumentFactory, FileIdManager, FsContents, RoomRegistry, RoomServices,
    SyncServer, UpdateStore,
};

fn env_millis(name: &str) -> Option<Duration> {
    let value = std::env::var(name).ok()?;
    match value.parse::<u64>() {
        Ok(0) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            log::warn!("Ignoring {name}={value}: {e}");
            None
        }
    }
}

/// Defaults overridden by `QUIRE_*` environment variables. A delay of 0
/// disables the corresponding timer.
fn config_from_env() -> CollabConfig {
    let root = std::env::var("QUIRE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let data_dir = std::env::var("QUIRE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| root.join(".quire"));
    let mut config = CollabConfig::rooted(root, data_dir);

    if let Ok(bind) = std::env::var("QUIRE_BIND") {
        config.server.bind_addr = bind;
    }
    if std::env::var("QUIRE_SAVE_DELAY_MS").is_ok() {
        config.room.save_delay = env_millis("QUIRE_SAVE_DELAY_MS");
    }
    if std::env::var("QUIRE_CLEANUP_DELAY_MS").is_ok() {
        config.room.cleanup_delay = env_millis("QUIRE_CLEANUP_DELAY_MS");
    }
    if let Ok(value) = std::env::var("QUIRE_HISTORY_TTL_SECS") {
        match value.parse::<u64>() {
            Ok(secs) => config.store.history_ttl = Some(Duration::from_secs(secs)),
            Err(e) => log::warn!("Ignoring QUIRE_HISTORY_TTL_SECS={value}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting quire-server for {} on {}",
        config.file_ids.root_dir.display(),
        config.server.bind_addr
    );

    let file_ids = Arc::new(FileIdManager::new(config.file_ids.clone())?);
    file_ids.start().await?;
    info!("Indexed {} paths", file_ids.len());

    let store = Arc::new(UpdateStore::open(config.store.clone())?);
    let contents = FsContents::new(file_ids.root()).with_file_ids(file_ids.clone());
    let services = RoomServices::new(Arc::new(contents))
        .with_store(store)
        .with_file_ids(file_ids.clone())
        .with_factory(DocumentFactory::with_defaults());
    let registry = RoomRegistry::new(services, config.room.clone());
    let server = SyncServer::new(config.server.clone(), registry.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    registry.shutdown().await;
    file_ids.stop().await;
    Ok(())
}
