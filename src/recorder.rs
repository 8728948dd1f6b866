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

use crate::aggregator::{Aggregator, AggregatorSettings, AggregatorState};
use crate::buffer::{DeviceStats, DeviceStatsSnapshot, SampleBuffer};
use crate::config::RecorderConfig;
use crate::error::{FlushFailure, RecorderError, SinkError};
use crate::ingest::{bind_udp_socket, IngestionWorker};
use crate::protocol::{DeviceId, Sample};
use crate::relay::{Popped, RelayQueue};
use crate::storage::SampleSink;
use dashmap::DashMap;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything one device's pipeline shares between its two tasks
#[derive(Debug)]
pub struct DeviceChannel {
    pub device_id: DeviceId,
    pub port: u16,
    pub queue: RelayQueue,
    pub buffer: RwLock<SampleBuffer>,
    pub stats: DeviceStats,
}

impl DeviceChannel {
    pub fn new(device_id: DeviceId, port: u16, max_data_count: usize) -> Self {
        Self {
            device_id,
            port,
            queue: RelayQueue::new(),
            buffer: RwLock::new(SampleBuffer::new(max_data_count)),
            stats: DeviceStats::default(),
        }
    }
}

struct DeviceTasks {
    channel: Arc<DeviceChannel>,
    worker: JoinHandle<()>,
    aggregator: JoinHandle<AggregatorState>,
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    devices: Vec<DeviceTasks>,
}

/// Outcome of [`RecorderManager::start`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub run_id: String,
    pub started: Vec<DeviceId>,
    /// Devices whose socket could not be opened, with the reason
    pub failed: Vec<(DeviceId, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub port: u16,
    pub final_flush_samples: usize,
    pub stats: DeviceStatsSnapshot,
}

/// Outcome of [`RecorderManager::stop`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    pub run_id: Option<String>,
    pub devices: Vec<DeviceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub port: u16,
    pub buffered_samples: usize,
    pub queue_depth: usize,
    pub stats: DeviceStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub running: bool,
    pub run_id: Option<String>,
    pub devices: Vec<DeviceStatus>,
}

/// Owns the per-device pipelines and their lifecycle
pub struct RecorderManager {
    config: RecorderConfig,
    sink: Arc<dyn SampleSink>,
    run: Mutex<Option<ActiveRun>>,
    // readable without the lifecycle lock, for live snapshots
    channels: DashMap<DeviceId, Arc<DeviceChannel>>,
    run_id: std::sync::RwLock<Option<String>>,
}

impl RecorderManager {
    pub fn new(config: RecorderConfig, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            config,
            sink,
            run: Mutex::new(None),
            channels: DashMap::new(),
            run_id: std::sync::RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn SampleSink> {
        self.sink.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Start listening for devices `1..=device_count` on `base_port + device_id`
    pub async fn start(
        &self,
        device_count: u8,
        base_port: u16,
    ) -> Result<StartReport, RecorderError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(RecorderError::AlreadyRunning);
        }
        if device_count == 0 {
            return Err(RecorderError::InvalidDeviceCount);
        }

        let ports = (1..=device_count)
            .map(|device_id| {
                base_port
                    .checked_add(u16::from(device_id))
                    .map(|port| (device_id, port))
                    .ok_or(RecorderError::InvalidPort {
                        device_id,
                        base_port,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bind_ip: IpAddr = self
            .config
            .ingest
            .bind_address
            .parse()
            .unwrap_or_else(|_| {
                warn!(
                    "Invalid bind address '{}', falling back to 0.0.0.0",
                    self.config.ingest.bind_address
                );
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });

        // samples a failed stop left behind must reach the sink before a new run
        let unflushed = self.unflushed_devices();
        if !unflushed.is_empty() {
            return Err(RecorderError::UnflushedData { devices: unflushed });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        self.sink.initialize(&run_id).await?;

        let cancel = CancellationToken::new();
        let settings = AggregatorSettings::from_config(&self.config.pipeline, &self.config.storage);
        let mut report = StartReport {
            run_id: run_id.clone(),
            ..StartReport::default()
        };
        let mut devices = Vec::with_capacity(ports.len());

        for (device_id, port) in ports {
            let addr = SocketAddr::new(bind_ip, port);
            let socket = match bind_udp_socket(addr, self.config.ingest.recv_buffer_bytes) {
                Ok(socket) => socket,
                Err(source) => {
                    let err = RecorderError::Socket {
                        device_id,
                        port,
                        source,
                    };
                    error!("{}", err);
                    report.failed.push((device_id, err.to_string()));
                    continue;
                }
            };

            let channel = Arc::new(DeviceChannel::new(
                device_id,
                port,
                self.config.pipeline.max_data_count,
            ));
            self.channels.insert(device_id, channel.clone());

            let worker = IngestionWorker::new(
                channel.clone(),
                socket,
                &self.config.ingest,
                cancel.child_token(),
            );
            let aggregator = Aggregator::new(channel.clone(), self.sink.clone(), settings.clone());

            devices.push(DeviceTasks {
                channel,
                worker: tokio::spawn(worker.run()),
                aggregator: tokio::spawn(aggregator.run()),
            });
            report.started.push(device_id);
        }

        info!(
            "Recording run {} started: {} device(s) from port {}, {} failed",
            run_id,
            report.started.len(),
            base_port,
            report.failed.len()
        );

        if let Ok(mut current) = self.run_id.write() {
            *current = Some(run_id.clone());
        }
        *run = Some(ActiveRun {
            run_id,
            cancel,
            devices,
        });

        Ok(report)
    }

    /// Stop every pipeline, drain it, and persist what is still in memory.
    ///
    /// Calling this without an active run is a no-op.
    pub async fn stop(&self) -> Result<StopReport, RecorderError> {
        let mut run = self.run.lock().await;
        let Some(active) = run.take() else {
            debug!("Stop requested with no active run");
            return Ok(StopReport::default());
        };

        info!("Stopping recording run {}", active.run_id);
        let deadline = Instant::now() + self.config.pipeline.shutdown_grace();
        active.cancel.cancel();

        let mut stuck: Vec<(DeviceId, &'static str)> = Vec::new();
        let mut drained: Vec<Arc<DeviceChannel>> = Vec::new();

        // workers first so every batch they pushed sits ahead of the sentinel
        let mut pending_aggregators = Vec::with_capacity(active.devices.len());
        for device in active.devices {
            let device_id = device.channel.device_id;
            if !join_until(device.worker, deadline, device_id, "ingestion worker").await {
                stuck.push((device_id, "ingestion worker"));
                device.aggregator.abort();
                let _ = device.aggregator.await;
                continue;
            }
            device.channel.queue.push_end_of_stream();
            pending_aggregators.push((device.channel, device.aggregator));
        }

        for (channel, aggregator) in pending_aggregators {
            if join_until(aggregator, deadline, channel.device_id, "aggregator").await {
                drained.push(channel);
            } else {
                stuck.push((channel.device_id, "aggregator"));
            }
        }

        let (summaries, failures) = self.flush_all(drained).await;

        // stuck and failed devices keep their data reachable for retry_flush
        let mut unflushed: Vec<DeviceId> = failures
            .iter()
            .map(|f| f.device_id)
            .chain(stuck.iter().map(|(device_id, _)| *device_id))
            .collect();
        unflushed.sort_unstable();
        unflushed.dedup();
        self.channels.retain(|device_id, _| unflushed.contains(device_id));
        if let Ok(mut current) = self.run_id.write() {
            *current = None;
        }

        if let Some(&(device_id, task)) = stuck.first() {
            for (device_id, task) in &stuck {
                error!(
                    "{} for device {} missed the shutdown deadline; its data was not flushed",
                    task, device_id
                );
            }
            for failure in &failures {
                error!(
                    "Final flush for device {} failed: {}",
                    failure.device_id, failure.error
                );
            }
            return Err(RecorderError::ShutdownTimeout {
                device_id,
                task,
                unflushed,
            });
        }

        if !failures.is_empty() {
            return Err(RecorderError::FlushFailed(failures));
        }

        info!(
            "Recording run {} stopped, {} device(s) flushed",
            active.run_id,
            summaries.len()
        );

        Ok(StopReport {
            run_id: Some(active.run_id),
            devices: summaries,
        })
    }

    /// Persist every drained device's remaining samples concurrently
    async fn flush_all(
        &self,
        channels: Vec<Arc<DeviceChannel>>,
    ) -> (Vec<DeviceSummary>, Vec<FlushFailure>) {
        let max_retries = self.config.storage.max_retries;
        let mut flushes = JoinSet::new();

        for channel in channels {
            let sink = self.sink.clone();
            flushes.spawn(async move {
                let result = flush_device(&channel, sink.as_ref(), max_retries).await;
                (channel, result)
            });
        }

        let mut summaries = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = flushes.join_next().await {
            let (channel, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Final flush task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(flushed) => summaries.push(DeviceSummary {
                    device_id: channel.device_id,
                    port: channel.port,
                    final_flush_samples: flushed,
                    stats: channel.stats.snapshot(),
                }),
                Err(error) => failures.push(FlushFailure {
                    device_id: channel.device_id,
                    error,
                }),
            }
        }

        summaries.sort_by_key(|s| s.device_id);
        failures.sort_by_key(|f| f.device_id);
        (summaries, failures)
    }

    /// Retry the final flush of devices left over by a failed [`stop`](Self::stop)
    pub async fn retry_flush(&self) -> Result<StopReport, RecorderError> {
        let run = self.run.lock().await;
        if run.is_some() {
            return Err(RecorderError::AlreadyRunning);
        }

        let channels: Vec<Arc<DeviceChannel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        let (summaries, failures) = self.flush_all(channels).await;
        self.retain_unflushed(&failures);

        if !failures.is_empty() {
            return Err(RecorderError::FlushFailed(failures));
        }
        Ok(StopReport {
            run_id: None,
            devices: summaries,
        })
    }

    /// Devices whose samples a failed stop left in memory
    pub fn unflushed_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.channels.iter().map(|c| *c.key()).collect();
        devices.sort_unstable();
        devices
    }

    fn retain_unflushed(&self, failures: &[FlushFailure]) {
        self.channels
            .retain(|device_id, _| failures.iter().any(|f| f.device_id == *device_id));
    }

    /// Copy of a device's in-memory samples, for live views
    pub async fn snapshot(&self, device_id: DeviceId) -> Option<Vec<Sample>> {
        let channel = self.channels.get(&device_id)?.value().clone();
        let buffer = channel.buffer.read().await;
        Some(buffer.snapshot())
    }

    pub async fn status(&self) -> RecorderStatus {
        let channels: Vec<Arc<DeviceChannel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();

        let mut devices = Vec::with_capacity(channels.len());
        for channel in channels {
            devices.push(DeviceStatus {
                device_id: channel.device_id,
                port: channel.port,
                buffered_samples: channel.buffer.read().await.len(),
                queue_depth: channel.queue.len(),
                stats: channel.stats.snapshot(),
            });
        }
        devices.sort_by_key(|d| d.device_id);

        let run_id = self.run_id.read().ok().and_then(|id| id.clone());
        RecorderStatus {
            running: run_id.is_some(),
            run_id,
            devices,
        }
    }
}

/// Await a task until `deadline`; abort it and return false if it is late
async fn join_until<T>(
    handle: JoinHandle<T>,
    deadline: Instant,
    device_id: DeviceId,
    task: &'static str,
) -> bool {
    let mut handle = handle;
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            // a panicked task has nothing left to drain
            error!("{} for device {} terminated abnormally: {}", task, device_id, e);
            true
        }
        Err(_) => {
            handle.abort();
            // once cancelled the task no longer touches the device's buffer
            let _ = handle.await;
            false
        }
    }
}

async fn flush_device(
    channel: &DeviceChannel,
    sink: &dyn SampleSink,
    max_retries: u32,
) -> Result<usize, SinkError> {
    // batches an aborted aggregator never picked up
    loop {
        match channel.queue.pop(Duration::ZERO).await {
            Popped::Batch(samples) => channel.buffer.write().await.extend(samples),
            Popped::EndOfStream | Popped::Empty => break,
        }
    }

    let remaining = channel.buffer.read().await.snapshot();
    if remaining.is_empty() {
        return Ok(0);
    }

    sink.append_with_retry(channel.device_id, &remaining, max_retries)
        .await?;

    channel.buffer.write().await.evict(remaining.len());
    channel.stats.record_persisted(remaining.len());
    debug!(
        "Final flush wrote {} samples for device {}",
        remaining.len(),
        channel.device_id
    );
    Ok(remaining.len())
}
