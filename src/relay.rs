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
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Item handed from an ingestion worker to its aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum Relay {
    Batch(Vec<Sample>),
    /// End-of-stream marker pushed once the producer is done
    EndOfStream,
}

/// Result of [`RelayQueue::pop`]
#[derive(Debug, Clone, PartialEq)]
pub enum Popped {
    Batch(Vec<Sample>),
    EndOfStream,
    /// Nothing arrived within the timeout
    Empty,
}

/// Single-producer / single-consumer handoff for one device.
///
/// Pushes never block the network read path. Once the consumer has popped
/// [`Relay::EndOfStream`] the queue is finished and every later pop returns
/// `EndOfStream` without draining anything queued afterwards.
#[derive(Debug, Default)]
pub struct RelayQueue {
    items: SegQueue<Relay>,
    notify: Notify,
    depth: AtomicUsize,
    finished: AtomicBool,
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an item and return the queue depth after the push
    pub fn push(&self, item: Relay) -> usize {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.items.push(item);
        self.notify.notify_one();
        depth
    }

    pub fn push_end_of_stream(&self) {
        self.push(Relay::EndOfStream);
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the next item
    pub async fn pop(&self, timeout: Duration) -> Popped {
        if let Some(popped) = self.try_pop() {
            return popped;
        }

        // notify_one stores a permit when nobody is waiting, so a push racing
        // with this wait still wakes us
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.try_pop().unwrap_or(Popped::Empty)
    }

    fn try_pop(&self) -> Option<Popped> {
        if self.is_finished() {
            return Some(Popped::EndOfStream);
        }

        let item = self.items.pop()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);

        Some(match item {
            Relay::Batch(samples) => Popped::Batch(samples),
            Relay::EndOfStream => {
                self.finished.store(true, Ordering::Release);
                Popped::EndOfStream
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn batch(ts: u32) -> Vec<Sample> {
        vec![Sample::adc(ts, 1)]
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = RelayQueue::new();
        let popped = queue.pop(Duration::from_millis(20)).await;
        assert_eq!(popped, Popped::Empty);
    }

    #[tokio::test]
    async fn test_items_before_sentinel_are_drained_in_order() {
        let queue = RelayQueue::new();
        queue.push(Relay::Batch(batch(1)));
        queue.push(Relay::Batch(batch(2)));
        queue.push_end_of_stream();
        queue.push(Relay::Batch(batch(3)));

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.pop(timeout).await, Popped::Batch(batch(1)));
        assert_eq!(queue.pop(timeout).await, Popped::Batch(batch(2)));
        assert_eq!(queue.pop(timeout).await, Popped::EndOfStream);
        // sentinel is terminal
        assert_eq!(queue.pop(timeout).await, Popped::EndOfStream);
        assert!(queue.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(RelayQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(Relay::Batch(batch(9)));
        });

        let popped = queue.pop(Duration::from_secs(5)).await;
        assert_eq!(popped, Popped::Batch(batch(9)));
        assert!(queue.is_empty());
    }
}
