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

// Configuration module for espnow-recorder
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Apply BASE_PORT, DEVICE_COUNT and OUTPUT_DIR overrides
pub fn apply_env_overrides(config: &mut RecorderConfig) -> Result<()> {
    if let Ok(base_port) = std::env::var("BASE_PORT") {
        config.ingest.base_port = base_port
            .parse()
            .with_context(|| format!("BASE_PORT is not a valid port: {}", base_port))?;
    }

    if let Ok(device_count) = std::env::var("DEVICE_COUNT") {
        config.ingest.device_count = device_count
            .parse()
            .with_context(|| format!("DEVICE_COUNT is not a valid count: {}", device_count))?;
    }

    if let Ok(output_dir) = std::env::var("OUTPUT_DIR") {
        if let Some(fs_config) = config.storage.filesystem.as_mut() {
            fs_config.base_path = output_dir;
        }
    }

    Ok(())
}
