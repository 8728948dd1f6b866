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

// Multi-device telemetry recorder for ESP-NOW sensor networks
//
// A base station forwards each sensor node's ADC samples as UDP datagrams,
// one port per node. This crate:
// - Listens on one socket per device and decodes the station's frames
// - Hands decoded batches to a per-device aggregator through a relay queue
// - Keeps a capped in-memory window per device, persisting overflow as it is evicted
// - Drains and flushes every device on shutdown without losing samples

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod ingest;
pub mod protocol;
pub mod recorder;
pub mod relay;
pub mod storage;

// Re-export main types
pub use buffer::{DeviceStats, DeviceStatsSnapshot, SampleBuffer};
pub use config::{load_config, load_config_with_env, RecorderConfig};
pub use control::{HandshakeOutcome, StationHandshake};
pub use error::{DecodeError, RecorderError, SinkError};
pub use protocol::{decode, encode, DeviceId, Frame, FrameFormat, Sample, SampleValue};
pub use recorder::{DeviceChannel, RecorderManager, RecorderStatus, StartReport, StopReport};
pub use relay::{Popped, Relay, RelayQueue};
pub use storage::{FilesystemSink, MemorySink, SampleSink, SinkFactory};
