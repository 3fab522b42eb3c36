use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warden_core::{cancel_pair, FeatureExtractor};
use warden_engine::RecognitionService;
use warden_store::Store;
use warden_vault::SqliteKeyManager;

mod config;
mod dbus_interface;
mod vision;

use config::{BusKind, Config};

const BUS_NAME: &str = "io.warden.Engine1";
const OBJECT_PATH: &str = "/io/warden/Engine1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        vision_url = %config.vision_url,
        "wardend starting"
    );

    let store = Store::open(&config.db_path)
        .await
        .context("failed to open store")?;
    let policies = config.load_policies().context("failed to load store policies")?;
    tracing::info!(stores = policies.len(), "store policies loaded");
    let engine_config = config.engine_config(&policies);

    let analyzer = vision::HttpVisionAnalyzer::new(&config.vision_url, config.vision_timeout)
        .context("failed to build vision client")?;
    let extractor = FeatureExtractor::new(Arc::new(analyzer), config.embedding_dim)
        .with_timeout(config.vision_timeout);
    let keys = Arc::new(SqliteKeyManager::new(store.clone()));
    let service = Arc::new(RecognitionService::new(
        store,
        keys,
        Arc::new(policies),
        extractor,
        engine_config,
    ));

    let (shutdown, shutdown_token) = cancel_pair();
    let sweeper = service.sweeper();
    let sweep_interval = config.sweep_interval;
    let sweep_task = tokio::spawn(async move { sweeper.run(sweep_interval, shutdown_token).await });

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::WardenService::new(service))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, "wardend ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("wardend shutting down");
    shutdown.cancel();
    if let Err(e) = sweep_task.await {
        tracing::warn!(error = %e, "retention sweeper task ended abnormally");
    }

    Ok(())
}
