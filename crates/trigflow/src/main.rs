// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigflow - Broker-Triggered Automation Controller
//!
//! A long-running process responsible for:
//! - Subscribing to the trigger topic and surviving broker reconnects
//! - Starting one workflow or operation per accepted trigger
//! - Tracking started runs to completion
//! - Uploading files created in the watched directory

use std::sync::Arc;
use tracing::{info, warn};

use trigflow::config::Config;
use trigflow::runtime::CompanionRuntime;
use trigflow_platform::{HttpPlatform, PlatformConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trigflow=info,trigflow_platform=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let platform_config = PlatformConfig::from_env()?;

    info!(
        broker_url = %config.broker.url,
        topic = %config.broker.topic,
        platform_url = %platform_config.base_url,
        watch_dir = %config.watcher.dir.display(),
        "Starting Trigflow"
    );

    let platform = Arc::new(HttpPlatform::new(platform_config)?);

    let runtime = CompanionRuntime::builder()
        .config(config)
        .platform(platform)
        .build()?
        .start()
        .await?;

    info!("Trigflow ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Trigflow shut down");

    Ok(())
}
