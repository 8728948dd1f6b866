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

//! Batch aggregation and overflow persistence for one device.
//!
//! The aggregator is the only writer of its device's [`SampleBuffer`]
//! (apart from the recorder's final flush, which runs after the aggregator has
//! stopped). That lets eviction copy the overflow under the lock, write it to
//! the sink with the lock released, and truncate afterwards without another
//! appender slipping in between.
//!
//! [`SampleBuffer`]: crate::buffer::SampleBuffer

use crate::config::{PipelineConfig, StorageConfig};
use crate::protocol::Sample;
use crate::recorder::DeviceChannel;
use crate::relay::Popped;
use crate::storage::SampleSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub buffer_limit: usize,
    pub pop_timeout: Duration,
    pub max_retries: u32,
}

impl AggregatorSettings {
    pub fn from_config(pipeline: &PipelineConfig, storage: &StorageConfig) -> Self {
        Self {
            buffer_limit: pipeline.buffer_limit,
            pop_timeout: pipeline.pop_timeout(),
            max_retries: storage.max_retries,
        }
    }
}

pub struct Aggregator {
    channel: Arc<DeviceChannel>,
    sink: Arc<dyn SampleSink>,
    settings: AggregatorSettings,
    pending: Vec<Sample>,
    state: AggregatorState,
}

impl Aggregator {
    pub fn new(
        channel: Arc<DeviceChannel>,
        sink: Arc<dyn SampleSink>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            pending: Vec::with_capacity(settings.buffer_limit),
            channel,
            sink,
            settings,
            state: AggregatorState::Running,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Drain the relay queue until its end-of-stream marker
    pub async fn run(mut self) -> AggregatorState {
        let device_id = self.channel.device_id;
        debug!("Aggregator for device {} running", device_id);

        while self.state == AggregatorState::Running {
            match self.channel.queue.pop(self.settings.pop_timeout).await {
                Popped::Batch(samples) => {
                    self.pending.extend(samples);
                    if self.pending.len() >= self.settings.buffer_limit {
                        self.commit_pending().await;
                    }
                }
                Popped::EndOfStream => self.state = AggregatorState::Draining,
                Popped::Empty => {}
            }
        }

        self.commit_pending().await;
        self.state = AggregatorState::Stopped;

        info!(
            "Aggregator for device {} stopped with {} samples retained",
            device_id,
            self.channel.buffer.read().await.len()
        );
        self.state
    }

    /// Move the accumulation buffer into the retention buffer, then persist
    /// and evict whatever exceeds the retention cap
    async fn commit_pending(&mut self) {
        let evicted = {
            let mut buffer = self.channel.buffer.write().await;
            buffer.extend(self.pending.drain(..));
            let overflow = buffer.overflow();
            if overflow == 0 {
                return;
            }
            buffer.oldest(overflow)
        };

        let device_id = self.channel.device_id;
        match self
            .sink
            .append_with_retry(device_id, &evicted, self.settings.max_retries)
            .await
        {
            Ok(()) => {
                self.channel.buffer.write().await.evict(evicted.len());
                self.channel.stats.record_persisted(evicted.len());
                self.channel.stats.record_eviction();
                debug!(
                    "Evicted {} samples for device {} to {}",
                    evicted.len(),
                    device_id,
                    self.sink.sink_type()
                );
            }
            Err(e) => {
                // keep everything in memory, the next trigger retries
                self.channel.stats.record_sink_failure();
                warn!(
                    "Eviction write for device {} failed, keeping {} samples in memory: {}",
                    device_id,
                    evicted.len(),
                    e
                );
            }
        }
    }
}
