//! PCM frame codec for the live transport
//!
//! Outbound microphone blocks become 16-bit little-endian PCM wrapped in
//! base64; inbound model audio goes the other way and lands in a playable
//! buffer on an output context.

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::backend::AudioFrame;
use super::output::{OutputContext, PcmBuffer};
use crate::error::{LiveError, LiveResult};

/// Rate the live model expects for realtime input
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the audio the live model streams back
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A transport-ready audio frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFrame {
    /// Base64-encoded PCM bytes
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Encode a captured block at the capture rate.
pub fn encode_frame(samples: &[f32]) -> EncodedFrame {
    encode_frame_at(samples, CAPTURE_SAMPLE_RATE)
}

pub fn encode_frame_at(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    encode_audio_frame(&AudioFrame::from_f32(samples, sample_rate))
}

pub fn encode_audio_frame(frame: &AudioFrame) -> EncodedFrame {
    EncodedFrame {
        data: base64::engine::general_purpose::STANDARD.encode(frame.to_le_bytes()),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode a base64 PCM payload into normalized float samples.
pub fn decode_samples(payload: &str) -> LiveResult<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| LiveError::decode(format!("invalid base64: {}", e)))?;

    let frame = AudioFrame::from_le_bytes(&bytes, PLAYBACK_SAMPLE_RATE, 1).ok_or_else(|| {
        LiveError::decode(format!(
            "payload is {} bytes, not a whole number of 16-bit samples",
            bytes.len()
        ))
    })?;

    Ok(frame.to_f32())
}

/// Decode a payload and allocate it as a playable buffer on `context`.
pub fn decode_audio(
    payload: &str,
    context: &dyn OutputContext,
    sample_rate: u32,
    channels: u16,
) -> LiveResult<PcmBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(LiveError::decode(format!(
            "unplayable format: {}Hz, {} channels",
            sample_rate, channels
        )));
    }

    let samples = decode_samples(payload)?;
    if samples.len() % channels as usize != 0 {
        return Err(LiveError::decode(format!(
            "{} samples do not split into {} channels",
            samples.len(),
            channels
        )));
    }

    Ok(context.create_buffer(samples, sample_rate, channels))
}

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler for mono audio
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = (source_pos - source_idx as f64) as f32;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx];
                let right = samples[source_idx + 1];
                left + (right - left) * fraction
            }
        })
        .collect()
}
