use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use recast_common::Backend;
use recast_device::{DeviceConfig, UploadManager};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(config: &DeviceConfig) -> Result<()> {
    let directives = config.log_filter();
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter '{}'", directives))?;
    let json_layer = config.json.then(|| fmt::layer().json());
    let text_layer = (!config.json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = DeviceConfig::parse();
    init_tracing(&config)?;

    let backend = Arc::new(Backend::new(config.backend_config()).context("Failed to create backend client")?);
    let _refresh = match config.credentials() {
        Some((email, password)) => {
            backend
                .sign_in_with_password(email, password)
                .await
                .context("Device sign-in failed")?;
            Some(backend.spawn_session_refresh(|_| {}))
        }
        None => {
            tracing::info!("no device credentials configured, using the anon key");
            None
        }
    };

    let manager = UploadManager::new(
        backend.clone(),
        backend.clone(),
        config.data_dir.clone(),
        config.device_id.clone(),
    );
    tracing::info!(data_dir = %config.data_dir.display(), "device daemon started");

    tokio::select! {
        result = manager.run(backend) => result.context("Upload manager stopped")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
