use anyhow::{Context, Result};
use connection_manager::{
    default_adapters, default_handlers, RetryPolicy, StoredTokens, TokenRefreshScheduler,
};
use std::sync::Arc;
use tether::config::{load_config, EngineConfig};
use tether::connection::SqliteConnectionStore;
use tether::credentials::AesGcmCodec;
use tether::error::{ErrorCode, ErrorRegistry, TokenRefreshStrategy};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connection_manager=info,tether=info".into()),
        )
        .init();

    info!("Connection Manager starting...");

    let mut config = match std::env::var("TETHER_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => EngineConfig::default(),
    };
    config.apply_env();

    info!(
        database = %config.storage.database_path,
        check_interval_secs = config.scheduler.check_interval_secs,
        refresh_threshold_secs = config.scheduler.refresh_threshold_secs,
        webhook = config.scheduler.failure_webhook_url.is_some(),
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteConnectionStore::new(&config.storage.database_path)
            .context("Failed to initialize connection store")?,
    );
    let codec = Arc::new(AesGcmCodec::from_env()?);

    let errors = Arc::new(
        ErrorRegistry::with_defaults(config.errors.history_size, None)
            .with_tracking_endpoint(config.errors.tracking_endpoint.clone()),
    );

    let handlers = Arc::new(default_handlers());
    info!(platforms = ?handlers.list_supported(), "OAuth handlers registered");

    let scheduler = Arc::new(TokenRefreshScheduler::new(
        &config.scheduler,
        store.clone(),
        codec.clone(),
        handlers,
        Arc::clone(&errors),
    ));
    errors.register_recovery_strategy(
        ErrorCode::TokenExpired,
        Arc::new(TokenRefreshStrategy::new(scheduler.recovery_hook())),
    );

    let adapters = default_adapters(
        Arc::clone(&errors),
        RetryPolicy::from(&config.adapter),
        Arc::new(StoredTokens::new(store, codec)),
    );
    info!(platforms = ?adapters.list_supported(), "API adapters registered");

    scheduler.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    scheduler.stop();

    Ok(())
}
