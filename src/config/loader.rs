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

// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub struct ConfigLoader;

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("env substitution pattern is valid")
    })
}

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file {}", path.as_ref().display())
        })?;

        Self::load_str(&content)
    }

    /// Parse and validate configuration text
    pub fn load_str(content: &str) -> Result<RecorderConfig> {
        let content = Self::substitute_env_vars(content);

        let config: RecorderConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${BASE_PORT:-10000} -> 10000 (if BASE_PORT not set)
    fn substitute_env_vars(content: &str) -> String {
        env_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &RecorderConfig) -> Result<()> {
        let ingest = &config.ingest;
        if ingest.device_count == 0 {
            bail!("ingest.device_count must be > 0");
        }

        if ingest
            .base_port
            .checked_add(u16::from(ingest.device_count))
            .is_none()
        {
            bail!(
                "ingest.base_port {} leaves no room for {} device ports",
                ingest.base_port,
                ingest.device_count
            );
        }

        if ingest.recv_timeout_ms == 0 {
            bail!("ingest.recv_timeout_ms must be > 0");
        }

        if ingest.max_datagram_bytes < crate::protocol::MIN_FRAME_LEN {
            bail!(
                "ingest.max_datagram_bytes must be at least {}",
                crate::protocol::MIN_FRAME_LEN
            );
        }

        let pipeline = &config.pipeline;
        if pipeline.buffer_limit == 0 {
            bail!("pipeline.buffer_limit must be > 0");
        }

        if pipeline.max_data_count == 0 {
            bail!("pipeline.max_data_count must be > 0");
        }

        if pipeline.queue_pop_timeout_ms == 0 {
            bail!("pipeline.queue_pop_timeout_ms must be > 0");
        }

        if pipeline.shutdown_grace_seconds == 0 {
            bail!("pipeline.shutdown_grace_seconds must be > 0");
        }

        match config.storage.backend.as_str() {
            "filesystem" => {
                if config.storage.filesystem.is_none() {
                    bail!("filesystem backend selected but filesystem config missing");
                }
            }
            "memory" => {}
            unknown => bail!("Unknown backend: '{}'. Supported: filesystem, memory", unknown),
        }

        if let Some(station) = &config.station {
            if station.address.is_empty() {
                bail!("station.address cannot be empty");
            }
            if station.timeout_seconds == 0 {
                bail!("station.timeout_seconds must be > 0");
            }
        }

        Ok(())
    }
}
