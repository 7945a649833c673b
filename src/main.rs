//! CryptoPulse ingestion daemon.
//! Loads config, starts the pipeline, serves the read API, drains on Ctrl-C.
//!
//! Usage: `cryptopulse-ingest [CONFIG_PATH]`. Without an argument the config
//! is resolved from `$CRYPTOPULSE_CONFIG_PATH`, then `config/pipeline.toml`,
//! then `config/pipeline.json`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use cryptopulse_ingest::metrics::Metrics;
use cryptopulse_ingest::{
    create_router, init_tracing, load_config_default, load_config_from, AppState, Coordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent. Credentials are usually here.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = match std::env::args().nth(1) {
        Some(p) => load_config_from(&PathBuf::from(&p)).with_context(|| format!("loading {p}"))?,
        None => load_config_default().context("loading pipeline config")?,
    };
    if cfg.sources.is_empty() {
        tracing::warn!("no sources configured; the pipeline will idle");
    }
    let addr = cfg.http_addr.clone();
    let stop_timeout = cfg.stop_timeout();

    let metrics = Metrics::init(cfg.bucket_width_secs)?;
    let coordinator = Arc::new(Coordinator::from_config(cfg).context("building pipeline")?);
    coordinator.start().context("starting pipeline")?;

    let router = create_router(AppState::new(coordinator.clone()).with_metrics(metrics));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "http api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server")?;

    let report = coordinator
        .stop(stop_timeout)
        .await
        .context("stopping pipeline")?;
    tracing::info!(graceful = report.graceful, stashed = report.stashed, "bye");
    Ok(())
}
