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

// Sink factory for creating storage sinks from configuration

use super::backend::SampleSink;
use super::filesystem::FilesystemSink;
use super::memory::MemorySink;
use crate::config::StorageConfig;
use anyhow::{bail, Result};
use std::sync::Arc;

pub struct SinkFactory;

impl SinkFactory {
    /// Create storage sink from configuration
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn SampleSink>> {
        match config.backend.as_str() {
            "filesystem" => {
                let fs_config = config
                    .filesystem
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Filesystem config missing"))?;

                Ok(Arc::new(FilesystemSink::new(fs_config.clone())))
            }

            "memory" => Ok(Arc::new(MemorySink::new())),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: filesystem, memory",
                unknown
            ),
        }
    }
}
