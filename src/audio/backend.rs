use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use super::codec::CAPTURE_SAMPLE_RATE;
use super::file::FileMicrophone;
use super::output::{OutputFactory, VirtualOutputFactory};
use crate::error::LiveResult;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Capture time in milliseconds since the stream started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Quantize normalized float samples. Out-of-range input saturates.
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        let samples = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32768.0) as i16)
            .collect();

        Self {
            samples,
            sample_rate,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Reinterpret little-endian bytes as i16 samples.
    ///
    /// Returns `None` when the byte count is odd; a trailing half sample is
    /// never silently dropped.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Option<Self> {
        if bytes.len() % 2 != 0 {
            return None;
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Some(Self {
            samples,
            sample_rate,
            channels,
            timestamp_ms: 0,
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }
}

/// What the capture side asks of a microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Sample rate of delivered blocks
    pub sample_rate: u32,
    /// Channel count of delivered blocks (the live model expects mono)
    pub channels: u16,
    /// Samples per block. 4096 at 16kHz is ~256ms per frame.
    pub block_size: usize,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            block_size: 4096,
        }
    }
}

impl CaptureConstraints {
    pub fn block_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

/// Keeps a capture device open. Releasing it must be idempotent.
pub trait DeviceGuard: Send {
    fn release(&mut self);
}

impl DeviceGuard for tokio::task::AbortHandle {
    fn release(&mut self) {
        self.abort();
    }
}

/// Ownership of an acquired capture device. Dropping it releases the device.
pub struct DeviceHandle {
    label: String,
    guard: Option<Box<dyn DeviceGuard>>,
}

impl DeviceHandle {
    pub fn new(label: impl Into<String>, guard: impl DeviceGuard + 'static) -> Self {
        Self {
            label: label.into(),
            guard: Some(Box::new(guard)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }

    /// Release the device. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
            info!("Released capture device: {}", self.label);
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live microphone: a stream of float blocks plus the device keeping it alive.
pub struct MicrophoneStream {
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub device: DeviceHandle,
}

/// Microphone collaborator
///
/// Implementations:
/// - `FileMicrophone`: replays a WAV file at real-time cadence
/// - `CpalMicrophone`: default input device via cpal (feature `cpal-audio`)
#[async_trait::async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Ask for access to the microphone.
    ///
    /// Denial or device failure is reported as `LiveError::Device`; callers
    /// do not retry.
    async fn acquire(&self, constraints: &CaptureConstraints) -> LiveResult<MicrophoneStream>;

    /// Get source name for logging
    fn name(&self) -> &str;
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create the microphone collaborator for the configured source
    pub fn microphone(source: AudioSource) -> Result<Arc<dyn MicrophoneSource>> {
        match source {
            AudioSource::Microphone { device } => {
                #[cfg(feature = "cpal-audio")]
                {
                    use super::cpal_device::CpalMicrophone;
                    Ok(Arc::new(CpalMicrophone::new(device)))
                }

                #[cfg(not(feature = "cpal-audio"))]
                {
                    anyhow::bail!(
                        "Microphone capture ({}) requires the `cpal-audio` feature; use an input WAV file instead",
                        device.as_deref().unwrap_or("default device")
                    )
                }
            }

            AudioSource::File(path) => Ok(Arc::new(FileMicrophone::new(path))),
        }
    }

    /// Create the playback collaborator
    ///
    /// Speakers need the `cpal-audio` feature; otherwise playback runs on a
    /// wall clock without sound, optionally recording the reply to WAV.
    pub fn output(speakers: bool, record_path: Option<PathBuf>) -> Result<Arc<dyn OutputFactory>> {
        if speakers {
            #[cfg(feature = "cpal-audio")]
            {
                use super::cpal_device::CpalOutputFactory;
                return Ok(Arc::new(CpalOutputFactory::default()));
            }

            #[cfg(not(feature = "cpal-audio"))]
            {
                anyhow::bail!("Speaker playback requires the `cpal-audio` feature")
            }
        }

        let mut factory = VirtualOutputFactory::wall_clock();
        if let Some(path) = record_path {
            factory = factory.with_recording(path);
        }
        Ok(Arc::new(factory))
    }
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Microphone input (named device or system default)
    Microphone { device: Option<String> },
    /// WAV file replayed as if spoken into a microphone
    File(PathBuf),
}
