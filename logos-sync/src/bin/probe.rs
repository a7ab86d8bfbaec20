//! Connects a sync session to a server and logs everything it hears.
//!
//! Usage: `RUST_LOG=debug logos-sync-probe ws://127.0.0.1:9090`

use log::{error, info, warn};

use logos_sync::{DocumentStore, MemoryStore, SyncConfig, SyncEvent, SyncSession};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(url) => SyncConfig::new(url),
        None => SyncConfig::default(),
    };
    info!("Starting sync probe against {}", config.server_url);

    let store = MemoryStore::new();
    let mut handle = SyncSession::spawn(config, store.clone(), store.clone());
    let Some(mut events) = handle.take_event_rx() else {
        error!("Event receiver already taken");
        return;
    };

    if let Err(e) = handle.connect().await {
        // The session keeps retrying on its own schedule
        warn!("Initial connect failed: {e}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SyncEvent::Reconciled { version, applied, confirmed }) => {
                    info!(
                        "Reconciled to v{version}: {} applied, {} confirmed, {} entities",
                        applied.len(),
                        confirmed.len(),
                        store.current().len()
                    );
                }
                Some(event) => info!("{event:?}"),
                None => break,
            },
        }
    }

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        error!("Shutdown failed: {e}");
    }
}
