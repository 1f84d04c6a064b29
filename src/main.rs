use std::sync::Arc;

use tokio::net::TcpListener;

use logprompt_service::{
    AppConfig, ModelCache, build_router,
    telemetry::init_tracing,
    model::{ArtifactStore, registry::CATALOG, tch_backend::TchLoader},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("LogPrompt API starting");

    let store = ArtifactStore::from_config(&config);
    store.ensure_models_dir()?;
    let on_disk: Vec<&str> = CATALOG
        .iter()
        .filter(|d| store.locate(d).is_some())
        .map(|d| d.short_id)
        .collect();

    let loader = Arc::new(TchLoader::new(&config));
    tracing::info!(
        models_dir = %store.models_dir().display(),
        device = ?loader.device(),
        cuda_available = tch::Cuda::is_available(),
        libtorch = ?config.libtorch_path,
        "runtime configured"
    );
    tracing::info!(
        "pre-downloaded models: {}/{}",
        on_disk.len(),
        CATALOG.len()
    );
    if on_disk.is_empty() {
        tracing::warn!("no pre-downloaded models found, run `download_models` to fetch them ahead of time");
    } else {
        tracing::info!(models = %on_disk.join(", "), "available locally");
    }

    let cache = Arc::new(ModelCache::new(loader));
    for name in &config.preload_models {
        if let Err(err) = cache.preload(name).await {
            tracing::error!(model = %name, error = %err, "preload failed, continuing");
        }
    }

    let router = build_router(cache);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("LogPrompt API shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
