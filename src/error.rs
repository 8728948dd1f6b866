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

// Error types shared across the recording pipeline

use crate::protocol::DeviceId;
use thiserror::Error;

/// Reasons a datagram is rejected by the frame decoder.
///
/// These never leave the ingestion worker: the datagram is dropped and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes (minimum {min})")]
    TooShort { len: usize, min: usize },

    #[error("bad frame header: 0x{found:02X} (expected 0xAA)")]
    BadHeader { found: u8 },
}

/// Failure while persisting samples to a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize samples: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// One device whose final flush did not reach the sink
#[derive(Debug)]
pub struct FlushFailure {
    pub device_id: DeviceId,
    pub error: SinkError,
}

fn describe_failures(failures: &[FlushFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("device {}: {}", f.device_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the recorder lifecycle
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("device count must be at least 1")]
    InvalidDeviceCount,

    #[error("invalid port for device {device_id}: base port {base_port} + {device_id} is out of range")]
    InvalidPort { device_id: DeviceId, base_port: u16 },

    #[error("failed to open UDP socket for device {device_id} on port {port}: {source}")]
    Socket {
        device_id: DeviceId,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("devices {devices:?} still hold samples from the last run; call retry_flush first")]
    UnflushedData { devices: Vec<DeviceId> },

    #[error(
        "{task} for device {device_id} did not stop within the shutdown grace period \
         ({} device(s) left unflushed)", .unflushed.len()
    )]
    ShutdownTimeout {
        device_id: DeviceId,
        task: &'static str,
        /// Every device whose data is still in memory, stuck or failed
        unflushed: Vec<DeviceId>,
    },

    #[error("final flush failed for {} device(s): {}", .0.len(), describe_failures(.0))]
    FlushFailed(Vec<FlushFailure>),
}
