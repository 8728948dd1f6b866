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

//! Wire format of the base station's telemetry datagrams.
//!
//! ```text
//! byte 0      0xAA header
//! byte 1      device id
//! byte 2      reserved
//! byte 3..    repeated { u32 timestamp, u16 | f32 value }, little-endian
//! ```
//!
//! Samples are read until less than one stride remains; leftover bytes are
//! ignored.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-byte sensor node identifier, also used to derive the node's UDP port
pub type DeviceId = u8;

pub const FRAME_HEADER: u8 = 0xAA;
pub const MIN_FRAME_LEN: usize = 20;
pub const SAMPLES_OFFSET: usize = 3;

/// Sample layout used by a deployment. Never mixed within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// u32 timestamp + u16 ADC reading (6 bytes)
    #[default]
    Compact,
    /// u32 timestamp + f32 reading (8 bytes), used by older station firmware
    Legacy,
}

impl FrameFormat {
    pub fn stride(self) -> usize {
        match self {
            FrameFormat::Compact => 6,
            FrameFormat::Legacy => 8,
        }
    }
}

/// Decoded reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Adc(u16),
    Float(f32),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Adc(v) => write!(f, "{}", v),
            SampleValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One timestamped reading. The timestamp is the node's own clock counter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: u32,
    pub value: SampleValue,
}

impl Sample {
    pub fn adc(timestamp: u32, value: u16) -> Self {
        Self {
            timestamp,
            value: SampleValue::Adc(value),
        }
    }

    pub fn float(timestamp: u32, value: f32) -> Self {
        Self {
            timestamp,
            value: SampleValue::Float(value),
        }
    }
}

/// A successfully decoded datagram
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub device_id: DeviceId,
    pub samples: Vec<Sample>,
}

/// Decode one datagram.
///
/// Fails only on a short datagram or a wrong header byte. A partially
/// received trailing sample is dropped, not reported.
pub fn decode(bytes: &[u8], format: FrameFormat) -> Result<Frame, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }
    if bytes[0] != FRAME_HEADER {
        return Err(DecodeError::BadHeader { found: bytes[0] });
    }

    let device_id = bytes[1];
    let stride = format.stride();
    let samples = bytes[SAMPLES_OFFSET..]
        .chunks_exact(stride)
        .map(|chunk| decode_sample(chunk, format))
        .collect();

    Ok(Frame { device_id, samples })
}

fn decode_sample(chunk: &[u8], format: FrameFormat) -> Sample {
    let timestamp = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    match format {
        FrameFormat::Compact => Sample::adc(timestamp, u16::from_le_bytes([chunk[4], chunk[5]])),
        FrameFormat::Legacy => Sample::float(
            timestamp,
            f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        ),
    }
}

/// Build a datagram from samples, the inverse of [`decode`].
///
/// Values are converted to the format's width: in compact frames a float
/// loses its fraction and saturates to `0..=65535`, in legacy frames an ADC
/// count becomes an exact `f32`.
pub fn encode(device_id: DeviceId, samples: &[Sample], format: FrameFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(SAMPLES_OFFSET + samples.len() * format.stride());
    out.push(FRAME_HEADER);
    out.push(device_id);
    out.push(0);
    for sample in samples {
        out.extend_from_slice(&sample.timestamp.to_le_bytes());
        match (format, sample.value) {
            (FrameFormat::Compact, SampleValue::Adc(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (FrameFormat::Compact, SampleValue::Float(v)) => {
                out.extend_from_slice(&(v as u16).to_le_bytes())
            }
            (FrameFormat::Legacy, SampleValue::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (FrameFormat::Legacy, SampleValue::Adc(v)) => {
                out.extend_from_slice(&(v as f32).to_le_bytes())
            }
        }
    }
    out
}
