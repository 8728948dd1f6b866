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

// Sink trait for append-only sample persistence

use crate::error::SinkError;
use crate::protocol::{DeviceId, Sample};
use async_trait::async_trait;

/// Durable, append-only destination for persisted samples
///
/// Every call appends `samples` after whatever was previously written for the
/// same device, preserving their order. Implementations must tolerate being
/// called concurrently for different devices.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Prepare the sink for a new recording run
    ///
    /// Called by the recorder on every start, before any append.
    async fn initialize(&self, run_id: &str) -> Result<(), SinkError>;

    /// Append samples for a device
    async fn append(&self, device_id: DeviceId, samples: &[Sample]) -> Result<(), SinkError>;

    /// Append with retry logic (optional, has default implementation)
    ///
    /// # Arguments
    /// * `device_id` - Device the samples belong to
    /// * `samples` - Samples in arrival order
    /// * `max_retries` - Additional attempts after the first failure
    async fn append_with_retry(
        &self,
        device_id: DeviceId,
        samples: &[Sample],
        max_retries: u32,
    ) -> Result<(), SinkError> {
        use tokio::time::{sleep, Duration};
        use tracing::{info, warn};

        let mut attempt = 0;
        let mut delay = Duration::from_millis(50);

        loop {
            match self.append(device_id, samples).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            "Persisted {} samples for device {} after {} retries",
                            samples.len(),
                            device_id,
                            attempt
                        );
                    }
                    return Ok(());
                }
                Err(e) if attempt < max_retries => {
                    warn!(
                        "Sink write for device {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        device_id,
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Sink write for device {} failed after {} attempts: {}",
                        device_id,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Health check
    async fn health_check(&self) -> Result<bool, SinkError>;

    /// Get sink type identifier
    fn sink_type(&self) -> &str;
}
