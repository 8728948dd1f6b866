// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Context, Result};
use clap::Parser;
use espnow_recorder::config::{
    apply_env_overrides, ConfigLoader, LoggingConfig, RecorderConfig, StationConfig,
};
use espnow_recorder::{load_config_with_env, RecorderManager, SinkFactory, StationHandshake};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// ESP-NOW Recorder - Record sensor node telemetry forwarded by a base station
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults are used when it does not exist)
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Number of devices (overrides config file)
    #[arg(short = 'n', long)]
    device_count: Option<u8>,

    /// Base UDP port; device N listens on base + N (overrides config file)
    #[arg(short, long)]
    base_port: Option<u16>,

    /// Base station address to handshake with before recording
    #[arg(short, long)]
    station: Option<String>,

    /// Stop automatically after this many seconds
    #[arg(short, long)]
    duration_secs: Option<u64>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "compact" => tracing::subscriber::set_global_default(builder.compact().finish())?,
        _ => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn load(args: &Args) -> Result<RecorderConfig> {
    let mut config = if args.config.exists() {
        load_config_with_env(&args.config)?
    } else {
        let mut config = RecorderConfig::default();
        apply_env_overrides(&mut config)?;
        config
    };

    // Apply CLI overrides
    if let Some(device_count) = args.device_count {
        config.ingest.device_count = device_count;
    }
    if let Some(base_port) = args.base_port {
        config.ingest.base_port = base_port;
    }
    if let Some(address) = &args.station {
        config.station = Some(StationConfig::new(address.clone()));
    }

    ConfigLoader::validate(&config).context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load(&args)?;
    init_tracing(&config.logging)?;

    info!("Starting ESP-NOW Recorder");
    info!("Configuration: {:?}", args.config);
    info!(
        "{} device(s) from base port {}, {:?} frames",
        config.ingest.device_count, config.ingest.base_port, config.ingest.frame_format
    );

    if let Some(station) = &config.station {
        let outcome = StationHandshake::new(station.clone()).connect().await;
        if !outcome.is_connected() {
            bail!("Base station handshake did not complete: {:?}", outcome);
        }
    }

    let sink = SinkFactory::create(&config.storage)?;
    info!("Storage sink: {}", sink.sink_type());

    let device_count = config.ingest.device_count;
    let base_port = config.ingest.base_port;
    let manager = Arc::new(RecorderManager::new(config, sink));

    let report = manager.start(device_count, base_port).await?;
    if report.started.is_empty() {
        manager.stop().await?;
        bail!("No device socket could be opened: {:?}", report.failed);
    }
    if !manager.sink().health_check().await? {
        warn!("Storage sink reports unhealthy, overflow writes may fail");
    }

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Recording duration of {}s elapsed", secs);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
        }
    }

    let stopped = match manager.stop().await {
        Err(e) if !manager.unflushed_devices().is_empty() => {
            warn!(
                "{}; retrying the final flush of devices {:?} once",
                e,
                manager.unflushed_devices()
            );
            let grace = manager.config().pipeline.shutdown_grace();
            match tokio::time::timeout(grace, manager.retry_flush()).await {
                Ok(retried) => retried,
                Err(_) => Err(e),
            }
        }
        other => other,
    };

    match stopped {
        Ok(report) => {
            info!("{}", serde_json::to_string(&report)?);
            info!("ESP-NOW Recorder shut down successfully");
            Ok(())
        }
        Err(e) => {
            error!("Shutdown failed: {}", e);
            Err(e.into())
        }
    }
}
