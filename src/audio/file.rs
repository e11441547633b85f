use anyhow::{Context, Result};
use hound::WavReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::backend::{CaptureConstraints, DeviceHandle, MicrophoneSource, MicrophoneStream};
use super::codec::{downmix, resample};
use crate::error::{LiveError, LiveResult};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            anyhow::bail!(
                "Expected 16-bit integer PCM, got {}-bit {:?}",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 /
            (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Normalized mono samples at `target_rate`
    pub fn to_mono_f32(&self, target_rate: u32) -> Vec<f32> {
        let floats: Vec<f32> = self.samples.iter().map(|&s| s as f32 / 32768.0).collect();
        let mono = downmix(&floats, self.channels as usize);
        resample(&mono, self.sample_rate, target_rate)
    }
}

/// Microphone stand-in that "speaks" a WAV file
///
/// Blocks are delivered on the same cadence a real device would produce them.
/// Once the file is exhausted the source keeps emitting silence, like an idle
/// microphone, until the device is released.
pub struct FileMicrophone {
    path: PathBuf,
    realtime: bool,
    pad_with_silence: bool,
}

impl FileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: true,
            pad_with_silence: true,
        }
    }

    /// Deliver blocks as fast as the consumer takes them
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// End the stream when the file runs out instead of idling on silence
    pub fn without_trailing_silence(mut self) -> Self {
        self.pad_with_silence = false;
        self
    }
}

#[async_trait::async_trait]
impl MicrophoneSource for FileMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> LiveResult<MicrophoneStream> {
        let path = self.path.clone();
        let audio = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| LiveError::device(format!("WAV loader panicked: {}", e)))?
            .map_err(|e| LiveError::device(format!("{:#}", e)))?;

        let samples = audio.to_mono_f32(constraints.sample_rate);
        let block_size = constraints.block_size.max(1);
        let cadence = constraints.block_duration().max(Duration::from_millis(1));
        let realtime = self.realtime;
        let pad_with_silence = self.pad_with_silence;
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut blocks = samples.chunks(block_size).map(|c| c.to_vec());
            loop {
                if realtime {
                    ticker.tick().await;
                }

                let block = match blocks.next() {
                    Some(mut block) => {
                        block.resize(block_size, 0.0);
                        block
                    }
                    None if pad_with_silence => vec![0.0; block_size],
                    None => break,
                };

                if tx.send(block).await.is_err() {
                    break;
                }
            }
        });

        if audio.samples.is_empty() {
            warn!("Input file {} contains no audio", audio.path);
        }

        info!(
            "File microphone acquired: {} ({:.1}s, {} samples per block)",
            audio.path, audio.duration_seconds, block_size
        );

        Ok(MicrophoneStream {
            blocks: rx,
            device: DeviceHandle::new(format!("file:{}", audio.path), task.abort_handle()),
        })
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}
