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

// Configuration types for espnow-recorder

use crate::protocol::FrameFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub station: Option<StationConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// UDP listener settings, shared by every device worker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default = "default_device_count")]
    pub device_count: u8,

    /// Device `n` listens on `base_port + n`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// SO_RCVBUF requested for each socket
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_bytes: usize,

    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,

    #[serde(default = "default_max_datagram")]
    pub max_datagram_bytes: usize,

    #[serde(default)]
    pub frame_format: FrameFormat,

    /// Drop frames whose embedded device id does not match the listening port
    #[serde(default)]
    pub enforce_device_id: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            device_count: default_device_count(),
            base_port: default_base_port(),
            bind_address: default_bind_address(),
            recv_buffer_bytes: default_recv_buffer(),
            recv_timeout_ms: default_recv_timeout(),
            max_datagram_bytes: default_max_datagram(),
            frame_format: FrameFormat::default(),
            enforce_device_id: false,
        }
    }
}

impl IngestConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// Aggregation and shutdown policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Samples accumulated before they are appended to the retention buffer
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,

    /// Retention cap of the in-memory buffer; overflow is persisted and evicted
    #[serde(default = "default_max_data_count")]
    pub max_data_count: usize,

    #[serde(default = "default_pop_timeout")]
    pub queue_pop_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_limit: default_buffer_limit(),
            max_data_count: default_max_data_count(),
            queue_pop_timeout_ms: default_pop_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl PipelineConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_pop_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Storage configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "filesystem" or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_filesystem")]
    pub filesystem: Option<FilesystemConfig>,

    /// Additional attempts after a failed sink write
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            filesystem: default_filesystem(),
            max_retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Jsonl,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Jsonl => "jsonl",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: String,
    #[serde(default)]
    pub file_format: FileFormat,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: "output_data".to_string(),
            file_format: FileFormat::default(),
        }
    }
}

/// Base station the recorder must handshake with before logging
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationConfig {
    pub address: String,

    #[serde(default = "default_station_port")]
    pub port: u16,

    #[serde(default = "default_station_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_request_payload")]
    pub request_payload: String,
}

impl StationConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: default_station_port(),
            timeout_seconds: default_station_timeout(),
            request_payload: default_request_payload(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,  // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String,  // "text", "compact"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_device_count() -> u8 { 1 }
fn default_base_port() -> u16 { 10000 }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_recv_buffer() -> usize { 65536 }
fn default_recv_timeout() -> u64 { 1000 }
fn default_max_datagram() -> usize { 2048 }
fn default_buffer_limit() -> usize { 1000 }
fn default_max_data_count() -> usize { 100_000 }
fn default_pop_timeout() -> u64 { 1000 }
fn default_shutdown_grace() -> u64 { 10 }
fn default_backend() -> String { "filesystem".to_string() }
fn default_retries() -> u32 { 1 }
fn default_filesystem() -> Option<FilesystemConfig> { Some(FilesystemConfig::default()) }
fn default_station_port() -> u16 { 10000 }
fn default_station_timeout() -> u64 { 20 }
fn default_request_payload() -> String { "Connection Request".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
