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

use crate::config::StationConfig;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

/// Result of the connect exchange with a base station
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandshakeOutcome {
    Connected { station: SocketAddr, ack_len: usize },
    TimedOut,
    Failed { reason: String },
}

impl HandshakeOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, HandshakeOutcome::Connected { .. })
    }
}

/// Request/acknowledge handshake announcing this recorder to the base station
///
/// The station learns the recorder's address from the request and replies
/// with any datagram once it will start forwarding telemetry.
pub struct StationHandshake {
    config: StationConfig,
}

impl StationHandshake {
    pub fn new(config: StationConfig) -> Self {
        Self { config }
    }

    pub async fn connect(&self) -> HandshakeOutcome {
        let target = format!("{}:{}", self.config.address, self.config.port);
        let station = match lookup_host(&target).await.map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                return HandshakeOutcome::Failed {
                    reason: format!("no address found for {}", target),
                }
            }
            Err(e) => {
                return HandshakeOutcome::Failed {
                    reason: format!("cannot resolve {}: {}", target, e),
                }
            }
        };

        let bind_addr: SocketAddr = if station.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                return HandshakeOutcome::Failed {
                    reason: format!("cannot open handshake socket: {}", e),
                }
            }
        };

        info!("Sending connection request to base station {}", station);
        if let Err(e) = socket
            .send_to(self.config.request_payload.as_bytes(), station)
            .await
        {
            return HandshakeOutcome::Failed {
                reason: format!("cannot send connection request: {}", e),
            };
        }

        let outcome = tokio::time::timeout(self.config.timeout(), Self::await_ack(&socket, station))
            .await
            .unwrap_or(HandshakeOutcome::TimedOut);

        match &outcome {
            HandshakeOutcome::Connected { .. } => info!("Connected to base station {}", station),
            HandshakeOutcome::TimedOut => warn!(
                "Base station {} did not acknowledge within {:?}",
                station,
                self.config.timeout()
            ),
            HandshakeOutcome::Failed { reason } => {
                warn!("Handshake with base station {} failed: {}", station, reason)
            }
        }
        outcome
    }

    async fn await_ack(socket: &UdpSocket, station: SocketAddr) -> HandshakeOutcome {
        let mut buf = [0u8; 1024];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) if peer.ip() == station.ip() => {
                    return HandshakeOutcome::Connected {
                        station: peer,
                        ack_len: len,
                    };
                }
                Ok((_, peer)) => debug!("Ignoring handshake reply from unexpected peer {}", peer),
                Err(e) => {
                    return HandshakeOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        }
    }
}
