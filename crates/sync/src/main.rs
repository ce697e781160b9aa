//! `stockroom-sync` daemon: keeps the local inventory store in sync with the
//! server until interrupted.

use std::sync::Arc;

use anyhow::Context;

use stockroom_sync::store::default_db_path;
use stockroom_sync::{Connectivity, HttpRemote, SqliteStore, SyncConfig, SyncEngine, SyncWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("invalid configuration")?;
    stockroom_observability::init(config.log_format, "info,sqlx=warn");

    let db_path = match &config.db_path {
        Some(path) => path.clone(),
        None => default_db_path().context("cannot resolve the default database path")?,
    };
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let mut remote = HttpRemote::new(config.api_url.clone(), config.request_timeout())
        .context("failed to build HTTP client")?;
    match &config.auth_token {
        Some(token) => {
            tracing::info!("using authentication token");
            remote = remote.with_token(token.clone());
        }
        None => tracing::warn!("STOCKROOM_AUTH_TOKEN not set; requests are unauthenticated"),
    }

    let registry = stockroom_inventory::registry().context("invalid entity catalog")?;
    let engine = SyncEngine::open(
        registry,
        Arc::new(store),
        Arc::new(remote),
        Connectivity::default(),
        &config,
    )
    .await
    .context("failed to start sync engine")?;

    tracing::info!(
        api_url = %config.api_url,
        db = %db_path.display(),
        "stockroom sync daemon starting"
    );

    let worker = SyncWorker::new(engine, config.sync_interval(), config.janitor_interval());
    let shutdown = worker.shutdown_signal();
    let task = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    shutdown.notify_one();
    task.await.context("sync worker panicked")?;
    Ok(())
}
