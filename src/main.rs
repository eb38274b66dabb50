//! mailmux - sync one folder of the configured mailbox into the local cache
//!
//! Usage: `mailmux [settings.json] [folder]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use mailmux::config::Settings;
use mailmux::providers::email::{create_driver, DriverConfig, RetryPolicy};
use mailmux::services::{SyncOutcome, SyncService};
use mailmux::storage::StorageLayer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("mailmux failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let settings_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => Settings::default_path()?,
    };
    let folder = args.next().unwrap_or_else(|| "inbox".to_string());

    let settings = Settings::load_or_default(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    let (provider_id, config) = DriverConfig::from_settings(&settings)?;

    tracing::info!(
        connection_id = %config.connection_id,
        provider = %provider_id,
        folder,
        "starting sync"
    );

    let storage = StorageLayer::open(&settings.storage)
        .await
        .context("opening cache storage")?;
    let driver = create_driver(&provider_id, config)?;
    let service = SyncService::new(
        driver.clone(),
        storage,
        RetryPolicy::from(&settings.retry),
        settings.sync,
    );

    let outcome = service.sync_threads(&folder).await;
    if let Err(e) = driver.close().await {
        tracing::warn!(error = %e, "closing driver failed");
    }

    match outcome? {
        SyncOutcome::Completed(report) => tracing::info!(
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed,
            pages = report.pages,
            "sync complete"
        ),
        SyncOutcome::AlreadyInProgress => tracing::info!(folder, "sync already running"),
    }
    Ok(())
}
