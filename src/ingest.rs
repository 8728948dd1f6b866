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

use crate::config::IngestConfig;
use crate::protocol::{decode, FrameFormat};
use crate::recorder::DeviceChannel;
use crate::relay::Relay;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Open a UDP socket with an enlarged kernel receive buffer.
///
/// Bursty stations send many datagrams back to back; the default SO_RCVBUF
/// drops them before the worker gets scheduled.
pub fn bind_udp_socket(addr: SocketAddr, recv_buffer_bytes: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(recv_buffer_bytes)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Receives one device's datagrams and forwards decoded batches to its relay queue
pub struct IngestionWorker {
    channel: Arc<DeviceChannel>,
    socket: UdpSocket,
    frame_format: FrameFormat,
    recv_timeout: Duration,
    max_datagram_bytes: usize,
    enforce_device_id: bool,
    cancel: CancellationToken,
}

impl IngestionWorker {
    pub fn new(
        channel: Arc<DeviceChannel>,
        socket: UdpSocket,
        config: &IngestConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            socket,
            frame_format: config.frame_format,
            recv_timeout: config.recv_timeout(),
            max_datagram_bytes: config.max_datagram_bytes,
            enforce_device_id: config.enforce_device_id,
            cancel,
        }
    }

    /// Receive until cancelled, then close the stream with a sentinel
    pub async fn run(self) {
        let device_id = self.channel.device_id;
        info!(
            "Listening on UDP port {} for device {}",
            self.channel.port, device_id
        );

        let mut buf = vec![0u8; self.max_datagram_bytes];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)) => received,
            };

            match received {
                // quiet link, go round and look at the stop signal again
                Err(_) => continue,
                Ok(Ok((len, peer))) => self.handle_datagram(&buf[..len], peer),
                Ok(Err(e)) => warn!("Receive error on device {} socket: {}", device_id, e),
            }
        }

        self.channel.queue.push_end_of_stream();
        info!(
            "Ingestion worker for device {} stopped ({} datagrams)",
            device_id,
            self.channel.stats.snapshot().datagrams_received
        );
    }

    fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        let channel = &self.channel;
        channel.stats.record_datagram();

        // recv_from silently drops whatever did not fit
        if bytes.len() >= self.max_datagram_bytes {
            channel.stats.record_truncated();
            debug!(
                "Datagram from {} for device {} filled the {}-byte buffer and may be truncated",
                peer, channel.device_id, self.max_datagram_bytes
            );
        }

        let frame = match decode(bytes, self.frame_format) {
            Ok(frame) => frame,
            Err(e) => {
                channel.stats.record_rejected();
                debug!(
                    "Dropping datagram from {} for device {}: {}",
                    peer, channel.device_id, e
                );
                return;
            }
        };

        if frame.device_id != channel.device_id {
            if self.enforce_device_id {
                channel.stats.record_rejected();
                warn!(
                    "Dropping frame for device {} received on port of device {}",
                    frame.device_id, channel.device_id
                );
                return;
            }
            debug!(
                "Frame tagged device {} arrived on port of device {}",
                frame.device_id, channel.device_id
            );
        }

        if frame.samples.is_empty() {
            return;
        }
        channel.stats.record_decoded(frame.samples.len());
        let depth = channel.queue.push(Relay::Batch(frame.samples));
        channel.stats.observe_queue_depth(depth);
    }
}
