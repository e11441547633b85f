//! Real audio devices through cpal: the default microphone for capture and
//! the default speakers for playback.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::backend::{CaptureConstraints, DeviceGuard, DeviceHandle, MicrophoneSource, MicrophoneStream};
use super::codec::{downmix, resample};
use super::output::{OutputContext, OutputFactory, PcmBuffer, SourceHandle};
use crate::error::{LiveError, LiveResult};

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is created on a blocking worker and afterwards only
/// paused and dropped by its single owner; it is never shared between threads.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

struct StreamGuard(Option<SendableStream>);

impl DeviceGuard for StreamGuard {
    fn release(&mut self) {
        if let Some(stream) = self.0.take() {
            if let Err(e) = stream.0.pause() {
                warn!("Failed to pause audio stream: {}", e);
            }
        }
    }
}

fn find_input_device(name: Option<&str>) -> LiveResult<cpal::Device> {
    let host = cpal::default_host();

    match name {
        Some(name) => {
            let devices = host
                .input_devices()
                .map_err(|e| LiveError::device(format!("Failed to enumerate devices: {}", e)))?;

            for device in devices {
                if let Ok(device_name) = device.name() {
                    if device_name == name {
                        return Ok(device);
                    }
                }
            }

            Err(LiveError::device(format!("Audio device not found: {}", name)))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| LiveError::device("No default input device")),
    }
}

/// Collects device callbacks into fixed-size blocks
struct Blocker {
    pending: Vec<f32>,
    block_size: usize,
    tx: mpsc::Sender<Vec<f32>>,
}

impl Blocker {
    fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            // Realtime capture: a full queue means the consumer is behind, so the block is lost.
            let _ = self.tx.try_send(block);
        }
    }
}

/// Microphone capture using CPAL
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn open_stream(
        device_name: Option<String>,
        constraints: CaptureConstraints,
        tx: mpsc::Sender<Vec<f32>>,
    ) -> LiveResult<(SendableStream, String)> {
        let device = find_input_device(device_name.as_deref())?;
        let label = device.name().unwrap_or_else(|_| "unknown".to_string());

        let err_callback = |err| {
            error!("Audio input stream error: {}", err);
        };

        let blocker = Arc::new(Mutex::new(Blocker {
            pending: Vec::with_capacity(constraints.block_size * 2),
            block_size: constraints.block_size.max(1),
            tx,
        }));

        // Preferred: the device delivers exactly what the session wants.
        let preferred_config = cpal::StreamConfig {
            channels: constraints.channels,
            sample_rate: cpal::SampleRate(constraints.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let sink = Arc::clone(&blocker);
        let requested_channels = constraints.channels as usize;
        if let Ok(stream) = device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Blocks are always mono, whatever the device was opened with.
                let mono = downmix(data, requested_channels);
                if let Ok(mut blocker) = sink.lock() {
                    blocker.push(&mono);
                }
            },
            err_callback,
            None,
        ) {
            return Ok((SendableStream(stream), label));
        }

        // Fallback: native config, converted in software.
        let default_config = device
            .default_input_config()
            .map_err(|e| LiveError::device(format!("Failed to query default input config: {}", e)))?;
        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = constraints.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            "Using native input format ({}ch/{}Hz/{:?}), converting in software",
            native_channels,
            native_rate,
            default_config.sample_format()
        );

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                let sink = Arc::clone(&blocker);
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let converted =
                            resample(&downmix(data, native_channels), native_rate, target_rate);
                        if let Ok(mut blocker) = sink.lock() {
                            blocker.push(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let sink = Arc::clone(&blocker);
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                        let converted =
                            resample(&downmix(&floats, native_channels), native_rate, target_rate);
                        if let Ok(mut blocker) = sink.lock() {
                            blocker.push(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
            }
            fmt => {
                return Err(LiveError::device(format!(
                    "Unsupported native sample format: {:?}",
                    fmt
                )))
            }
        }
        .map_err(|e| LiveError::device(format!("Failed to build input stream: {}", e)))?;

        Ok((SendableStream(stream), label))
    }
}

#[async_trait::async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> LiveResult<MicrophoneStream> {
        let (tx, rx) = mpsc::channel(16);
        let device_name = self.device_name.clone();
        let constraints = *constraints;

        let (stream, label) = tokio::task::spawn_blocking(move || {
            let (stream, label) = Self::open_stream(device_name, constraints, tx)?;
            stream
                .0
                .play()
                .map_err(|e| LiveError::device(format!("Failed to start audio stream: {}", e)))?;
            Ok::<_, LiveError>((stream, label))
        })
        .await
        .map_err(|e| LiveError::device(format!("Device worker panicked: {}", e)))??;

        info!("Microphone acquired: {}", label);

        Ok(MicrophoneStream {
            blocks: rx,
            device: DeviceHandle::new(label, StreamGuard(Some(stream))),
        })
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

struct CpalVoice {
    start_frame: u64,
    samples: Vec<f32>,
}

#[derive(Default)]
struct MixState {
    voices: BTreeMap<SourceHandle, CpalVoice>,
}

impl MixState {
    fn fill(&mut self, first_frame: u64, out: &mut [f32], channels: usize) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let frames = out.len() / channels.max(1);

        for voice in self.voices.values() {
            for i in 0..frames {
                let frame = first_frame + i as u64;
                if frame < voice.start_frame {
                    continue;
                }
                let Some(sample) = voice.samples.get((frame - voice.start_frame) as usize) else {
                    break;
                };
                for ch in 0..channels {
                    out[i * channels + ch] += sample;
                }
            }
        }

        let horizon = first_frame + frames as u64;
        self.voices
            .retain(|_, v| v.start_frame + v.samples.len() as u64 > horizon);
    }
}

/// Speaker output whose clock is the number of frames the device consumed
pub struct CpalOutput {
    sample_rate: u32,
    device_rate: u32,
    frames_played: Arc<AtomicU64>,
    mix: Arc<Mutex<MixState>>,
    stream: Option<SendableStream>,
    next_handle: u64,
}

impl CpalOutput {
    pub fn open(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No default output device")?;
        let config = device
            .default_output_config()
            .context("Failed to query default output config")?;

        let device_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let stream_config: cpal::StreamConfig = config.clone().into();
        let frames_played = Arc::new(AtomicU64::new(0));
        let mix = Arc::new(Mutex::new(MixState::default()));

        let err_callback = |err| {
            error!("Audio output stream error: {}", err);
        };

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                let (mix, played) = (Arc::clone(&mix), Arc::clone(&frames_played));
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let first = played.load(Ordering::Acquire);
                        if let Ok(mut mix) = mix.lock() {
                            mix.fill(first, data, channels);
                        }
                        played.fetch_add((data.len() / channels) as u64, Ordering::Release);
                    },
                    err_callback,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let (mix, played) = (Arc::clone(&mix), Arc::clone(&frames_played));
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0f32);
                        let first = played.load(Ordering::Acquire);
                        if let Ok(mut mix) = mix.lock() {
                            mix.fill(first, &mut scratch, channels);
                        }
                        for (out, s) in data.iter_mut().zip(&scratch) {
                            *out = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                        }
                        played.fetch_add((data.len() / channels) as u64, Ordering::Release);
                    },
                    err_callback,
                    None,
                )
            }
            fmt => anyhow::bail!("Unsupported output sample format: {:?}", fmt),
        }
        .context("Failed to build output stream")?;

        stream.play().context("Failed to start output stream")?;

        info!("Speaker output opened ({}Hz device, {} channels)", device_rate, channels);

        Ok(Self {
            sample_rate,
            device_rate,
            frames_played,
            mix,
            stream: Some(SendableStream(stream)),
            next_handle: 0,
        })
    }
}

impl OutputContext for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn start_at(&mut self, buffer: &PcmBuffer, when: f64) -> SourceHandle {
        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;

        let voice = CpalVoice {
            start_frame: (when.max(0.0) * self.device_rate as f64).round() as u64,
            samples: buffer.mono_at(self.device_rate),
        };
        if let Ok(mut mix) = self.mix.lock() {
            mix.voices.insert(handle, voice);
        }

        handle
    }

    fn stop(&mut self, handle: SourceHandle) {
        if let Ok(mut mix) = self.mix.lock() {
            mix.voices.remove(&handle);
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.0.pause() {
                warn!("Failed to pause output stream: {}", e);
            }
            if let Ok(mut mix) = self.mix.lock() {
                mix.voices.clear();
            }
            info!("Speaker output closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Opens the default speakers for each session
#[derive(Debug, Default)]
pub struct CpalOutputFactory;

impl OutputFactory for CpalOutputFactory {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        Ok(Box::new(CpalOutput::open(sample_rate)?))
    }
}
