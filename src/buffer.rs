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

use crate::protocol::Sample;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// In-memory retention buffer for one device.
///
/// Samples are kept in arrival order. The buffer never drops data on its own:
/// callers copy the overflow with [`SampleBuffer::oldest`], persist it, and only
/// then release it with [`SampleBuffer::evict`].
#[derive(Debug)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    max_data_count: usize,
}

impl SampleBuffer {
    pub fn new(max_data_count: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_data_count,
        }
    }

    pub fn extend<I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = Sample>,
    {
        self.samples.extend(samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples above the retention cap
    pub fn overflow(&self) -> usize {
        self.samples.len().saturating_sub(self.max_data_count)
    }

    /// Copy of the `n` oldest samples
    pub fn oldest(&self, n: usize) -> Vec<Sample> {
        self.samples.iter().take(n).copied().collect()
    }

    /// Drop the `n` oldest samples
    pub fn evict(&mut self, n: usize) {
        let n = n.min(self.samples.len());
        self.samples.drain(..n);
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }
}

/// Per-device pipeline counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    datagrams_received: AtomicU64,
    frames_rejected: AtomicU64,
    datagrams_truncated: AtomicU64,
    samples_decoded: AtomicU64,
    samples_persisted: AtomicU64,
    eviction_writes: AtomicU64,
    sink_failures: AtomicU64,
    peak_queue_depth: AtomicUsize,
}

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatsSnapshot {
    pub datagrams_received: u64,
    pub frames_rejected: u64,
    /// Datagrams that filled the receive buffer and may have been cut short
    pub datagrams_truncated: u64,
    pub samples_decoded: u64,
    pub samples_persisted: u64,
    pub eviction_writes: u64,
    pub sink_failures: u64,
    pub peak_queue_depth: usize,
}

impl DeviceStats {
    pub fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncated(&self) {
        self.datagrams_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, samples: usize) {
        self.samples_decoded
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, samples: usize) {
        self.samples_persisted
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.eviction_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            datagrams_truncated: self.datagrams_truncated.load(Ordering::Relaxed),
            samples_decoded: self.samples_decoded.load(Ordering::Relaxed),
            samples_persisted: self.samples_persisted.load(Ordering::Relaxed),
            eviction_writes: self.eviction_writes.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            peak_queue_depth: self.peak_queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(range: std::ops::Range<u32>) -> Vec<Sample> {
        range.map(|t| Sample::adc(t, t as u16)).collect()
    }

    #[test]
    fn test_overflow_and_evict() {
        let mut buffer = SampleBuffer::new(4);
        buffer.extend(samples(0..3));
        assert_eq!(buffer.overflow(), 0);

        buffer.extend(samples(3..7));
        assert_eq!(buffer.overflow(), 3);
        assert_eq!(buffer.oldest(3), samples(0..3));

        buffer.evict(3);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.snapshot(), samples(3..7));
    }

    #[test]
    fn test_evict_more_than_len() {
        let mut buffer = SampleBuffer::new(10);
        buffer.extend(samples(0..2));
        buffer.evict(5);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_stats_peak_depth() {
        let stats = DeviceStats::default();
        stats.observe_queue_depth(3);
        stats.observe_queue_depth(1);
        stats.record_decoded(12);
        let snap = stats.snapshot();
        assert_eq!(snap.peak_queue_depth, 3);
        assert_eq!(snap.samples_decoded, 12);
    }
}
