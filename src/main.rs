//! palmsync - HotSync daemon for Palm OS handhelds

use palmsync::config::Config;
use palmsync::error::Result;
use palmsync::storage::FileStorage;
use palmsync::sync::SyncServer;
use std::env;
use std::sync::Arc;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("palmsync v0.1.0 starting...");

    // Get config path from args or default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/palmsync.toml".to_string());

    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;
    log::info!("Listening mode: {:?}", config.mode());

    let storage = Arc::new(FileStorage::new(&config.storage.root)?);

    let mut server = SyncServer::new(config, storage);
    let controller = server.controller();

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        controller.stop();
    })
    .map_err(|e| palmsync::Error::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("palmsync running. Press Ctrl-C to stop.");
    server.run()?;

    log::info!("palmsync stopped");
    Ok(())
}
