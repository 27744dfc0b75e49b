//! PCM codec for the live voice protocol
//!
//! Converts between floating-point samples, 16-bit little-endian PCM and the
//! base64 text carried inside protocol frames.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Format tag of outbound microphone audio
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

const SCALE: f32 = 32768.0;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM payload has odd length {0}")]
    Misaligned(usize),
    #[error("Channel count must be at least 1")]
    NoChannels,
}

/// One self-contained unit of transport audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Base64 of little-endian 16-bit PCM
    pub data: String,
    pub mime_type: String,
}

/// Decoded planar audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    /// Number of sample frames
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Scale samples in [-1, 1] to little-endian 16-bit PCM bytes
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Encode captured samples as one outbound chunk
pub fn encode_for_transport(samples: &[f32]) -> AudioChunk {
    AudioChunk {
        data: STANDARD.encode(samples_to_pcm16(samples)),
        mime_type: INPUT_MIME_TYPE.to_string(),
    }
}

/// Reinterpret little-endian 16-bit PCM and de-interleave it by channel.
///
/// A trailing partial frame is dropped.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channel_count: u16) -> Result<PcmBuffer, CodecError> {
    if channel_count == 0 {
        return Err(CodecError::NoChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }

    let channel_count = channel_count as usize;
    let frame_count = bytes.len() / 2 / channel_count;
    let mut channels = vec![Vec::with_capacity(frame_count); channel_count];

    for (i, pair) in bytes.chunks_exact(2).take(frame_count * channel_count).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count].push(value as f32 / SCALE);
    }

    Ok(PcmBuffer {
        sample_rate,
        channels,
    })
}

/// Decode a base64 payload received from the transport
pub fn decode_from_transport(data: &str, sample_rate: u32, channel_count: u16) -> Result<PcmBuffer, CodecError> {
    let bytes = STANDARD.decode(data.trim())?;
    decode_pcm16(&bytes, sample_rate, channel_count)
}

/// Parse the `rate=` parameter of a PCM mime type
pub fn sample_rate_of(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .next()
        .and_then(|r| r.parse().ok())
}
