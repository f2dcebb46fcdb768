use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use upload_store::{
    config::AppConfig,
    routes,
    services::{BaseStorage, DiskStorage, TracingMetrics, spawn_purge_task},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting upload-store with config: {:?}", cfg);

    // --- Initialize storage ---
    let purge_interval = cfg
        .storage
        .expiration
        .as_ref()
        .and_then(|e| e.purge_interval);
    let storage = DiskStorage::new(cfg.storage.clone()).with_metrics(Arc::new(TracingMetrics));
    storage
        .init()
        .await
        .with_context(|| format!("initializing storage at {}", cfg.storage.directory.display()))?;
    let storage: Arc<dyn BaseStorage> = Arc::new(storage);

    if let Some(interval) = purge_interval {
        tracing::info!("Purging expired uploads every {:?}", interval);
        spawn_purge_task(storage.clone(), interval);
    }

    // --- Build router ---
    let app: Router = routes::routes(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
