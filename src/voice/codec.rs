//! PCM16 frame codec.
//!
//! Capture produces mono `f32` blocks in `[-1, 1]`; the engine speaks
//! little-endian signed 16-bit PCM. Encoding clamps before scaling so
//! out-of-range input saturates instead of wrapping around.

use base64::Engine;

use crate::error::{Result, SessionError};

/// Scale applied when converting `f32` samples to `i16`.
const ENCODE_SCALE: f32 = 32767.0;

/// Divisor applied when converting `i16` samples back to `f32`.
const DECODE_SCALE: f32 = 32768.0;

/// A decoded, de-interleaved audio buffer ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    /// Sample rate of the buffer in Hz.
    pub sample_rate: u32,
    /// One sample vector per channel, all of equal length.
    pub channels: Vec<Vec<f32>>,
}

impl DecodedBuffer {
    /// An empty buffer with the given layout.
    pub fn empty(sample_rate: u32, channel_count: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![Vec::new(); channel_count.max(1)],
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Encode mono float samples to little-endian PCM16 bytes.
///
/// Zero-length input yields an empty vector. The input slice is only read.
pub fn encode(frame: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() * 2);
    for &sample in frame {
        // NaN clamps to NaN; treat it as silence.
        let s = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        let value = (s * ENCODE_SCALE).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode interleaved little-endian PCM16 bytes into a [`DecodedBuffer`].
///
/// Zero-length input yields an empty buffer. Input that does not hold a
/// whole number of frames is rejected as a malformed chunk.
pub fn decode(bytes: &[u8], sample_rate: u32, channel_count: usize) -> Result<DecodedBuffer> {
    let channel_count = channel_count.max(1);
    if bytes.is_empty() {
        return Ok(DecodedBuffer::empty(sample_rate, channel_count));
    }

    let frame_bytes = 2 * channel_count;
    if bytes.len() % frame_bytes != 0 {
        return Err(SessionError::Codec {
            message: format!(
                "{} bytes is not a whole number of {channel_count}-channel PCM16 frames",
                bytes.len()
            ),
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (index, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        channels[index % channel_count].push(f32::from(value) / DECODE_SCALE);
    }

    Ok(DecodedBuffer {
        sample_rate,
        channels,
    })
}

/// Base64 text form of an encoded chunk, as carried inside JSON messages.
pub fn encode_base64(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Decode a base64 audio payload back to raw PCM bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SessionError::Codec {
            message: format!("invalid base64 audio payload: {e}"),
        })
}
