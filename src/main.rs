use std::sync::Arc;

use sentinel_lib::config::load_config;
use sentinel_lib::error::SentinelError;
use sentinel_lib::escalation::HttpNarrativeClient;
use sentinel_lib::scheduler::Sentinel;
use sentinel_lib::server;
use sentinel_lib::store::{EventStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<(), SentinelError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;

    let store: Arc<dyn EventStore> = if config.store.is_memory() {
        log::warn!("Sentinel: using in-memory store, events will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open_at(&config.store.sqlite_path()?)?)
    };

    let client = HttpNarrativeClient::new(&config.escalation, config.server.cron_secret.clone())
        .map_err(|e| SentinelError::Config(e.to_string()))?;

    let sentinel = Arc::new(Sentinel::new(config, store, Arc::new(client)));
    for warning in sentinel.warm().await {
        log::warn!("Sentinel: starting cold: {}", warning);
    }

    let ticker = sentinel
        .config()
        .server
        .self_schedule
        .then(|| sentinel.spawn_ticker());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Sentinel: failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Sentinel: shutdown requested");
    };
    let served = server::serve(Arc::clone(&sentinel), shutdown).await;

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    sentinel.close().await;
    served
}
