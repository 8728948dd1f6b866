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

// In-memory sink, for embedding the recorder and for tests

use super::backend::SampleSink;
use crate::error::SinkError;
use crate::protocol::{DeviceId, Sample};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

/// Sink that keeps every append call in memory, grouped per device
#[derive(Default)]
pub struct MemorySink {
    appends: DashMap<DeviceId, Vec<Vec<Sample>>>,
    run_id: RwLock<Option<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted sample of a device, concatenated in write order
    pub fn samples(&self, device_id: DeviceId) -> Vec<Sample> {
        self.appends
            .get(&device_id)
            .map(|calls| calls.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Individual append calls of a device
    pub fn append_calls(&self, device_id: DeviceId) -> Vec<Vec<Sample>> {
        self.appends
            .get(&device_id)
            .map(|calls| calls.value().clone())
            .unwrap_or_default()
    }

    pub async fn run_id(&self) -> Option<String> {
        self.run_id.read().await.clone()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn initialize(&self, run_id: &str) -> Result<(), SinkError> {
        self.appends.clear();
        *self.run_id.write().await = Some(run_id.to_string());
        Ok(())
    }

    async fn append(&self, device_id: DeviceId, samples: &[Sample]) -> Result<(), SinkError> {
        self.appends
            .entry(device_id)
            .or_default()
            .push(samples.to_vec());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        Ok(true)
    }

    fn sink_type(&self) -> &str {
        "memory"
    }
}
