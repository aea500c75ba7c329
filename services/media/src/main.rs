//! media-doctor: checks that the metadata store and object store configured
//! for the media service are reachable, and explains what to fix when not.

use anyhow::{Context, Result};
use catalog_media::config::{AssetStoreConfig, Config};
use catalog_media::connection::{mask_target, ConnectionSettings, ConnectionSupervisor};
use catalog_media::error::ConnectionError;
use catalog_media::metadata_store::{MetadataStore, PgBackend};
use catalog_media::{AssetStoreError, MetadataError, S3AssetStore};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(service = %config.service.name, "Starting media-doctor");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        eprintln!("configuration: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    let mut healthy = check_metadata_store(&config).await;

    if config.assets.bucket.trim().is_empty() {
        warn!("assets.bucket not set, skipping object store check");
    } else {
        healthy &= check_asset_store(&config.assets).await;
    }

    if healthy {
        info!("All checks passed");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Connect, ping and optionally migrate the metadata store.
async fn check_metadata_store(config: &Config) -> bool {
    let settings = ConnectionSettings::from_config(&config.database);
    let target = mask_target(&settings.target);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        PgBackend::new(&config.database),
        settings,
    ));

    let result = async {
        supervisor.connect().await?;
        supervisor.ping().await?;
        if config.database.run_migrations {
            MetadataStore::new(supervisor.clone())
                .ensure_indexes()
                .await
                .map_err(|e| match e {
                    MetadataError::Connection(e) => e,
                    other => ConnectionError::Operation(other.to_string()),
                })?;
        }
        Ok::<(), ConnectionError>(())
    }
    .await;

    if let Err(e) = supervisor.close().await {
        warn!(error = %e, "Failed to close metadata store connection");
    }

    match result {
        Ok(()) => {
            println!("metadata store: ok ({})", target);
            true
        }
        Err(e) => {
            println!("metadata store: FAILED ({})", target);
            println!("  error: {}", e);
            println!("  hint:  {}", e.hint());
            false
        }
    }
}

/// Build the S3 client from configuration and the AWS credential chain.
async fn check_asset_store(config: &AssetStoreConfig) -> bool {
    match S3AssetStore::new(config).await {
        Ok(store) => {
            println!("object store: ok (bucket {})", store.bucket());
            true
        }
        Err(e) => {
            println!("object store: FAILED");
            println!("  error: {}", e);
            if let AssetStoreError::NotConfigured(_) = e {
                println!("  hint:  set MEDIA__ASSETS__BUCKET, MEDIA__ASSETS__PUBLIC_BASE_URL and AWS credentials");
            }
            false
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}
