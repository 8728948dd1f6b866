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

// Filesystem sink implementation

use super::backend::SampleSink;
use crate::config::{FileFormat, FilesystemConfig};
use crate::error::SinkError;
use crate::protocol::{DeviceId, Sample};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const CSV_HEADER: &str = "Timestamp,Value\n";

/// Filesystem sink writing one append-only file per device
///
/// Each run gets its own directory under `base_path`, named after the run's
/// start time and id, so a restart never appends to an earlier run's files.
pub struct FilesystemSink {
    base_path: PathBuf,
    file_format: FileFormat,
    run_dir: RwLock<Option<PathBuf>>,
    // serializes writers of the same file
    file_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl FilesystemSink {
    pub fn new(config: FilesystemConfig) -> Self {
        let base_path = PathBuf::from(&config.base_path);

        info!(
            "Initializing filesystem sink at: {}",
            base_path.display()
        );

        Self {
            base_path,
            file_format: config.file_format,
            run_dir: RwLock::new(None),
            file_locks: DashMap::new(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory of the current run, once initialized
    pub async fn run_dir(&self) -> Option<PathBuf> {
        self.run_dir.read().await.clone()
    }

    /// Output file of a device for the current run
    pub async fn device_path(&self, device_id: DeviceId) -> Option<PathBuf> {
        self.run_dir()
            .await
            .map(|dir| dir.join(self.file_name(device_id)))
    }

    fn file_name(&self, device_id: DeviceId) -> String {
        format!("device_{}_output.{}", device_id, self.file_format.extension())
    }

    fn render(&self, samples: &[Sample]) -> Result<String, SinkError> {
        let mut out = String::with_capacity(samples.len() * 16);
        match self.file_format {
            FileFormat::Csv => {
                for sample in samples {
                    // writing to a String cannot fail
                    let _ = writeln!(out, "{},{}", sample.timestamp, sample.value);
                }
            }
            FileFormat::Jsonl => {
                for sample in samples {
                    out.push_str(&serde_json::to_string(sample)?);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }

    fn file_lock(&self, device_id: DeviceId) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(device_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn write_body(file: &mut fs::File, header: bool, body: &str) -> std::io::Result<()> {
    if header {
        file.write_all(CSV_HEADER.as_bytes()).await?;
    }
    file.write_all(body.as_bytes()).await?;
    file.flush().await
}

/// Cut the file back to the length it had before a failed append
async fn rollback(file: &fs::File, committed: u64) {
    if let Err(e) = file.set_len(committed).await {
        warn!(
            "Could not roll back partial append to {} bytes: {}",
            committed, e
        );
    }
}

#[async_trait]
impl SampleSink for FilesystemSink {
    async fn initialize(&self, run_id: &str) -> Result<(), SinkError> {
        let dir_name = format!(
            "{}_{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            run_id
        );
        let run_dir = self.base_path.join(dir_name);

        info!("Creating run directory: {}", run_dir.display());
        fs::create_dir_all(&run_dir).await?;

        *self.run_dir.write().await = Some(run_dir);
        Ok(())
    }

    async fn append(&self, device_id: DeviceId, samples: &[Sample]) -> Result<(), SinkError> {
        let path = self.device_path(device_id).await.ok_or_else(|| {
            SinkError::Unavailable("filesystem sink used before initialize".to_string())
        })?;

        let body = self.render(samples)?;
        let lock = self.file_lock(device_id);
        let _guard = lock.lock().await;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let committed = file.metadata().await?.len();
        // header only when the file is new
        let header = self.file_format == FileFormat::Csv && committed == 0;

        if let Err(e) = write_body(&mut file, header, &body).await {
            // a retried append must not follow a torn prefix of this one
            rollback(&file, committed).await;
            return Err(e.into());
        }

        debug!(
            "Appended {} samples for device {} to {}",
            samples.len(),
            device_id,
            path.display()
        );

        Ok(())
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        let dir = match self.run_dir().await {
            Some(dir) => dir,
            None => self.base_path.clone(),
        };

        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => {
                let probe = dir.join(".health_check_test");
                match fs::write(&probe, b"test").await {
                    Ok(()) => {
                        let _ = fs::remove_file(&probe).await;
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot write to {}: {}", dir.display(), e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!("Health check failed - not a directory: {}", dir.display());
                Ok(false)
            }
            Err(e) => {
                warn!("Health check failed - cannot access {}: {}", dir.display(), e);
                Ok(false)
            }
        }
    }

    fn sink_type(&self) -> &str {
        "filesystem"
    }
}
