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

/// Recorder lifecycle tests over real loopback UDP sockets
///
use async_trait::async_trait;
use espnow_recorder::config::{FileFormat, FilesystemConfig, RecorderConfig};
use espnow_recorder::protocol::{encode, DeviceId, FrameFormat, Sample, FRAME_HEADER};
use espnow_recorder::storage::{FilesystemSink, MemorySink, SampleSink};
use espnow_recorder::{RecorderError, RecorderManager, SinkError};
use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

fn test_config(buffer_limit: usize, max_data_count: usize) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.ingest.bind_address = "127.0.0.1".to_string();
    config.ingest.recv_timeout_ms = 100;
    config.pipeline.buffer_limit = buffer_limit;
    config.pipeline.max_data_count = max_data_count;
    config.pipeline.queue_pop_timeout_ms = 50;
    config.pipeline.shutdown_grace_seconds = 5;
    config.storage.backend = "memory".to_string();
    config
}

/// Base port such that `base + 1 ..= base + count` are currently free
fn free_base_port(count: u16) -> u16 {
    for _ in 0..50 {
        let probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let first = probe.local_addr().unwrap().port();
        if first.checked_add(count).is_none() {
            continue;
        }
        let others: Result<Vec<_>, _> = (1..count)
            .map(|offset| StdUdpSocket::bind(("127.0.0.1", first + offset)))
            .collect();
        if others.is_ok() {
            return first - 1;
        }
    }
    panic!("no free port range found");
}

/// Station datagram padded to the 20-byte minimum; the padding is shorter
/// than one sample and is dropped by the decoder
fn station_frame(device_id: DeviceId, samples: &[Sample]) -> Vec<u8> {
    let mut bytes = encode(device_id, samples, FrameFormat::Compact);
    if bytes.len() < 20 {
        bytes.resize(20, 0);
    }
    bytes
}

async fn send(port: u16, payload: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(payload, ("127.0.0.1", port)).await.unwrap();
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

async fn wait_for_datagrams(manager: &RecorderManager, device_id: DeviceId, expected: u64) {
    for _ in 0..200 {
        let status = manager.status().await;
        let received = status
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .map(|d| d.stats.datagrams_received)
            .unwrap_or(0);
        if received >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device {} did not receive {} datagrams", device_id, expected);
}

fn timestamps(samples: &[Sample]) -> Vec<u32> {
    samples.iter().map(|s| s.timestamp).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_datagram_scenario_with_mid_run_eviction() {
    let sink = Arc::new(MemorySink::new());
    let manager = RecorderManager::new(test_config(2, 4), sink.clone());
    let base_port = free_base_port(1);

    let report = manager.start(1, base_port).await.unwrap();
    assert_eq!(report.started, vec![1]);

    let frame = station_frame(1, &[Sample::adc(100, 10), Sample::adc(101, 11)]);
    for _ in 0..3 {
        send(base_port + 1, &frame).await;
    }

    // third batch pushes the buffer to 6 > 4, so two samples leave early
    wait_for(|| sink.samples(1).len() == 2).await;
    assert_eq!(timestamps(&sink.samples(1)), vec![100, 101]);
    let mut in_memory = Vec::new();
    for _ in 0..200 {
        in_memory = manager.snapshot(1).await.unwrap();
        if in_memory.len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(timestamps(&in_memory), vec![100, 101, 100, 101]);

    let stop = manager.stop().await.unwrap();
    assert_eq!(stop.devices.len(), 1);
    assert_eq!(stop.devices[0].final_flush_samples, 4);
    assert_eq!(stop.devices[0].stats.samples_persisted, 6);

    let persisted = sink.samples(1);
    assert_eq!(timestamps(&persisted), vec![100, 101, 100, 101, 100, 101]);
    assert_eq!(
        persisted.iter().map(|s| s.value.to_string()).collect::<Vec<_>>(),
        vec!["10", "11", "10", "11", "10", "11"]
    );
    assert_eq!(sink.append_calls(1).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_written_as_csv() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(FilesystemSink::new(FilesystemConfig {
        base_path: temp_dir.path().to_string_lossy().to_string(),
        file_format: FileFormat::Csv,
    }));
    let manager = RecorderManager::new(test_config(2, 4), sink.clone());
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    let frame = station_frame(1, &[Sample::adc(100, 10), Sample::adc(101, 11)]);
    for _ in 0..3 {
        send(base_port + 1, &frame).await;
    }
    wait_for_datagrams(&manager, 1, 3).await;
    manager.stop().await.unwrap();

    let path = sink.device_path(1).await.unwrap();
    let content = std::fs::read_to_string(path).unwrap();
    assert_eq!(
        content,
        "Timestamp,Value\n100,10\n101,11\n100,10\n101,11\n100,10\n101,11\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_datagram_never_reaches_sink() {
    let sink = Arc::new(MemorySink::new());
    let manager = RecorderManager::new(test_config(1, 100), sink.clone());
    let base_port = free_base_port(1);
    manager.start(1, base_port).await.unwrap();

    let mut short = vec![0u8; 19];
    short[0] = FRAME_HEADER;
    short[1] = 1;
    send(base_port + 1, &short).await;

    let mut bad_header = station_frame(1, &[Sample::adc(1, 1)]);
    bad_header[0] = 0x55;
    send(base_port + 1, &bad_header).await;

    send(base_port + 1, &station_frame(1, &[Sample::adc(7, 70), Sample::adc(8, 80)])).await;
    wait_for_datagrams(&manager, 1, 3).await;

    let report = manager.stop().await.unwrap();
    assert_eq!(report.devices[0].stats.frames_rejected, 2);
    assert_eq!(timestamps(&sink.samples(1)), vec![7, 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_persisted_stream_equals_input_stream() {
    let sink = Arc::new(MemorySink::new());
    let manager = RecorderManager::new(test_config(7, 13), sink.clone());
    let base_port = free_base_port(1);
    manager.start(1, base_port).await.unwrap();

    let mut expected = Vec::new();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in 0..50u32 {
        let samples: Vec<Sample> = (0..5)
            .map(|i| Sample::adc(datagram * 5 + i, (datagram * 5 + i) as u16))
            .collect();
        expected.extend(samples.iter().copied());
        socket
            .send_to(&station_frame(1, &samples), ("127.0.0.1", base_port + 1))
            .await
            .unwrap();
        if datagram % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    wait_for_datagrams(&manager, 1, 50).await;

    let buffered = manager.snapshot(1).await.unwrap();
    assert!(buffered.len() <= 13);

    manager.stop().await.unwrap();
    assert_eq!(sink.samples(1), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_devices_are_isolated() {
    let sink = Arc::new(MemorySink::new());
    let manager = RecorderManager::new(test_config(3, 1000), sink.clone());
    let base_port = free_base_port(3);

    let report = manager.start(3, base_port).await.unwrap();
    assert_eq!(report.started, vec![1, 2, 3]);

    for device_id in 1..=3u8 {
        let ts = u32::from(device_id) * 1000;
        let frame = station_frame(device_id, &[Sample::adc(ts, 1), Sample::adc(ts + 1, 2)]);
        send(base_port + u16::from(device_id), &frame).await;
    }
    for device_id in 1..=3u8 {
        wait_for_datagrams(&manager, device_id, 1).await;
    }

    let report = manager.stop().await.unwrap();
    assert_eq!(report.devices.len(), 3);
    for device_id in 1..=3u8 {
        let ts = u32::from(device_id) * 1000;
        assert_eq!(timestamps(&sink.samples(device_id)), vec![ts, ts + 1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_is_rejected() {
    let manager = RecorderManager::new(test_config(10, 100), Arc::new(MemorySink::new()));
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    assert!(manager.is_running().await);
    assert!(matches!(
        manager.start(1, base_port).await,
        Err(RecorderError::AlreadyRunning)
    ));
    manager.stop().await.unwrap();
    assert!(!manager.is_running().await);
}

#[tokio::test]
async fn test_port_out_of_range() {
    let manager = RecorderManager::new(test_config(10, 100), Arc::new(MemorySink::new()));

    let result = manager.start(3, 65534).await;
    assert!(matches!(
        result,
        Err(RecorderError::InvalidPort {
            device_id: 2,
            base_port: 65534
        })
    ));
    assert!(!manager.is_running().await);

    assert!(matches!(
        manager.start(0, 10000).await,
        Err(RecorderError::InvalidDeviceCount)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_idempotent() {
    let manager = RecorderManager::new(test_config(10, 100), Arc::new(MemorySink::new()));

    // no run yet
    let report = manager.stop().await.unwrap();
    assert!(report.run_id.is_none());

    let base_port = free_base_port(1);
    let started = manager.start(1, base_port).await.unwrap();
    let first = manager.stop().await.unwrap();
    assert_eq!(first.run_id, Some(started.run_id));

    let second = manager.stop().await.unwrap();
    assert!(second.run_id.is_none());
    assert!(second.devices.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_does_not_reuse_previous_run_state() {
    let sink = Arc::new(MemorySink::new());
    let manager = RecorderManager::new(test_config(1, 100), sink.clone());
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    send(base_port + 1, &station_frame(1, &[Sample::adc(1, 1)])).await;
    wait_for_datagrams(&manager, 1, 1).await;
    manager.stop().await.unwrap();
    assert!(manager.snapshot(1).await.is_none());

    let second = manager.start(1, base_port).await.unwrap();
    assert_eq!(second.started, vec![1]);

    let status = manager.status().await;
    assert!(status.running);
    assert_eq!(status.devices[0].stats.datagrams_received, 0);
    assert_eq!(status.devices[0].buffered_samples, 0);

    // the old sentinel must not end the new aggregator early
    tokio::time::sleep(Duration::from_millis(150)).await;
    send(base_port + 1, &station_frame(1, &[Sample::adc(2, 2), Sample::adc(3, 3)])).await;
    wait_for_datagrams(&manager, 1, 1).await;

    manager.stop().await.unwrap();
    // the memory sink starts every run empty
    assert_eq!(timestamps(&sink.samples(1)), vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_port_only_fails_that_device() {
    let manager = RecorderManager::new(test_config(10, 100), Arc::new(MemorySink::new()));
    let base_port = free_base_port(2);
    let _occupied = StdUdpSocket::bind(("127.0.0.1", base_port + 2)).unwrap();

    let report = manager.start(2, base_port).await.unwrap();
    assert_eq!(report.started, vec![1]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 2);

    let stop = manager.stop().await.unwrap();
    assert_eq!(stop.devices.len(), 1);
}

/// Sink that can be switched between failing and succeeding
struct SwitchableSink {
    inner: MemorySink,
    failing: AtomicBool,
}

#[async_trait]
impl SampleSink for SwitchableSink {
    async fn initialize(&self, run_id: &str) -> Result<(), SinkError> {
        self.inner.initialize(run_id).await
    }

    async fn append(&self, device_id: DeviceId, samples: &[Sample]) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("sink offline".to_string()));
        }
        self.inner.append(device_id, samples).await
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        Ok(!self.failing.load(Ordering::SeqCst))
    }

    fn sink_type(&self) -> &str {
        "switchable"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_final_flush_keeps_data_for_retry() {
    let sink = Arc::new(SwitchableSink {
        inner: MemorySink::new(),
        failing: AtomicBool::new(true),
    });
    let manager = RecorderManager::new(test_config(1, 100), sink.clone());
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    send(base_port + 1, &station_frame(1, &[Sample::adc(5, 5), Sample::adc(6, 6)])).await;
    wait_for_datagrams(&manager, 1, 1).await;

    match manager.stop().await {
        Err(RecorderError::FlushFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].device_id, 1);
        }
        other => panic!("expected flush failure, got {:?}", other),
    }
    assert_eq!(manager.snapshot(1).await.unwrap().len(), 2);

    sink.failing.store(false, Ordering::SeqCst);
    let report = manager.retry_flush().await.unwrap();
    assert_eq!(report.devices[0].final_flush_samples, 2);
    assert_eq!(timestamps(&sink.inner.samples(1)), vec![5, 6]);
    assert!(manager.snapshot(1).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_refuses_while_samples_unflushed() {
    let sink = Arc::new(SwitchableSink {
        inner: MemorySink::new(),
        failing: AtomicBool::new(true),
    });
    let manager = RecorderManager::new(test_config(1, 100), sink.clone());
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    send(base_port + 1, &station_frame(1, &[Sample::adc(5, 5), Sample::adc(6, 6)])).await;
    wait_for_datagrams(&manager, 1, 1).await;
    assert!(matches!(
        manager.stop().await,
        Err(RecorderError::FlushFailed(_))
    ));

    sink.failing.store(false, Ordering::SeqCst);
    match manager.start(1, base_port).await {
        Err(RecorderError::UnflushedData { devices }) => assert_eq!(devices, vec![1]),
        other => panic!("expected unflushed data error, got {:?}", other),
    }
    assert!(!manager.is_running().await);
    assert_eq!(manager.unflushed_devices(), vec![1]);
    assert_eq!(manager.snapshot(1).await.unwrap().len(), 2);

    let report = manager.retry_flush().await.unwrap();
    assert_eq!(report.devices[0].final_flush_samples, 2);
    assert_eq!(timestamps(&sink.inner.samples(1)), vec![5, 6]);
    assert!(manager.unflushed_devices().is_empty());

    manager.start(1, base_port).await.unwrap();
    manager.stop().await.unwrap();
}

/// Sink whose appends never complete
struct HangingSink {
    entered: AtomicBool,
}

#[async_trait]
impl SampleSink for HangingSink {
    async fn initialize(&self, _run_id: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn append(&self, _device_id: DeviceId, _samples: &[Sample]) -> Result<(), SinkError> {
        self.entered.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        Ok(true)
    }

    fn sink_type(&self) -> &str {
        "hanging"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stuck_aggregator_fails_stop_with_timeout() {
    let sink = Arc::new(HangingSink {
        entered: AtomicBool::new(false),
    });
    let mut config = test_config(1, 1);
    config.pipeline.shutdown_grace_seconds = 1;
    let manager = RecorderManager::new(config, sink.clone());
    let base_port = free_base_port(1);

    manager.start(1, base_port).await.unwrap();
    // two samples against a cap of one: the eviction write hangs
    send(base_port + 1, &station_frame(1, &[Sample::adc(1, 1), Sample::adc(2, 2)])).await;
    wait_for(|| sink.entered.load(Ordering::SeqCst)).await;

    let began = std::time::Instant::now();
    match manager.stop().await {
        Err(RecorderError::ShutdownTimeout {
            device_id,
            task,
            unflushed,
        }) => {
            assert_eq!(device_id, 1);
            assert_eq!(task, "aggregator");
            assert_eq!(unflushed, vec![1]);
        }
        other => panic!("expected shutdown timeout, got {:?}", other),
    }
    assert!(began.elapsed() < Duration::from_secs(3));
    assert!(!manager.is_running().await);

    // nothing was evicted, so the stuck device's samples are still reachable
    assert_eq!(manager.unflushed_devices(), vec![1]);
    assert_eq!(timestamps(&manager.snapshot(1).await.unwrap()), vec![1, 2]);
}
