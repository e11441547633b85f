// Output audio contexts: a clock plus the ability to start buffers at an
// absolute time on that clock.
//
// `VirtualOutput` keeps the timeline in memory. It can run on the wall clock
// (headless sessions, optionally rendering the reply to a WAV file) or on a
// manually advanced clock for deterministic tests. Real speakers live in
// `cpal_device` behind the `cpal-audio` feature.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::codec::{downmix, resample};

/// Identifies one started buffer on an output context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceHandle(pub u64);

/// A decoded buffer ready to be started on an output context
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Mono samples at `rate`, for renderers that mix a single channel
    pub fn mono_at(&self, rate: u32) -> Vec<f32> {
        let mono = downmix(&self.samples, self.channels as usize);
        resample(&mono, self.sample_rate, rate)
    }
}

/// Output audio clock/context collaborator
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;

    /// Seconds elapsed on the output clock
    fn current_time(&self) -> f64;

    /// Allocate a playable buffer
    fn create_buffer(&self, samples: Vec<f32>, sample_rate: u32, channels: u16) -> PcmBuffer {
        PcmBuffer::new(samples, sample_rate, channels)
    }

    /// Start `buffer` at absolute time `when` on the output clock
    fn start_at(&mut self, buffer: &PcmBuffer, when: f64) -> SourceHandle;

    /// Cut a started buffer immediately, discarding whatever has not played
    fn stop(&mut self, handle: SourceHandle);

    /// Release the context. Must be idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Opens output contexts for sessions
pub trait OutputFactory: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>>;
}

/// Manually advanced clock shared between a test and its output context
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, secs: f64) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = secs;
    }

    pub fn advance(&self, secs: f64) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) += secs;
    }
}

#[derive(Debug, Clone)]
enum Clock {
    Wall(Instant),
    Manual(ManualClock),
}

impl Clock {
    fn now(&self) -> f64 {
        match self {
            Clock::Wall(origin) => origin.elapsed().as_secs_f64(),
            Clock::Manual(clock) => clock.now(),
        }
    }
}

/// One buffer as it was scheduled on a virtual output
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRecord {
    pub handle: SourceHandle,
    pub start: f64,
    pub duration: f64,
    /// Clock time of a hard stop that landed before the natural end
    pub stopped_at: Option<f64>,
}

impl PlaybackRecord {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// When the buffer actually went silent
    pub fn audible_end(&self) -> f64 {
        match self.stopped_at {
            Some(at) => at.clamp(self.start, self.end()),
            None => self.end(),
        }
    }
}

/// Records kept by a wall-clock log; older ones are dropped first
pub const WALL_CLOCK_LOG_LIMIT: usize = 256;

/// Shared view of what was scheduled on virtual outputs from one factory
///
/// Unbounded by default. Long-running outputs use `bounded`, which keeps only
/// the most recent records.
#[derive(Debug, Clone, Default)]
pub struct PlaybackLog {
    records: Arc<Mutex<VecDeque<PlaybackRecord>>>,
    limit: Option<usize>,
}

impl PlaybackLog {
    pub fn bounded(limit: usize) -> Self {
        Self {
            records: Arc::default(),
            limit: Some(limit.max(1)),
        }
    }

    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn starts(&self) -> Vec<f64> {
        self.records().iter().map(|r| r.start).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PlaybackRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, record: PlaybackRecord) {
        let mut records = self.lock();
        records.push_back(record);
        if let Some(limit) = self.limit {
            while records.len() > limit {
                records.pop_front();
            }
        }
    }

    fn mark_stopped(&self, handle: SourceHandle, at: f64) {
        let mut records = self.lock();
        if let Some(record) = records.iter_mut().rev().find(|r| r.handle == handle) {
            if at < record.end() {
                record.stopped_at = Some(at);
            }
        }
    }
}

struct Voice {
    buffer: PcmBuffer,
    start: f64,
    stopped_at: Option<f64>,
}

/// In-memory output context
pub struct VirtualOutput {
    sample_rate: u32,
    clock: Clock,
    log: PlaybackLog,
    voices: BTreeMap<SourceHandle, Voice>,
    next_handle: u64,
    record_path: Option<PathBuf>,
    closed: bool,
}

impl VirtualOutput {
    pub fn wall_clock(sample_rate: u32) -> Self {
        Self::with_clock(
            sample_rate,
            Clock::Wall(Instant::now()),
            PlaybackLog::bounded(WALL_CLOCK_LOG_LIMIT),
        )
    }

    pub fn manual(sample_rate: u32, clock: ManualClock) -> Self {
        Self::with_clock(sample_rate, Clock::Manual(clock), PlaybackLog::default())
    }

    fn with_clock(sample_rate: u32, clock: Clock, log: PlaybackLog) -> Self {
        Self {
            sample_rate,
            clock,
            log,
            voices: BTreeMap::new(),
            next_handle: 0,
            record_path: None,
            closed: false,
        }
    }

    /// Render the audible timeline to `path` when the context closes
    pub fn record_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn log(&self) -> PlaybackLog {
        self.log.clone()
    }

    /// Buffers still held by this context
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Forget voices that have gone silent. Recording contexts keep every
    /// voice until close.
    fn prune(&mut self) {
        if self.record_path.is_some() {
            return;
        }
        let now = self.clock.now();
        self.voices.retain(|_, voice| Self::audible_end(voice) > now);
    }

    /// Mix every retained voice, honouring hard stops, into one mono timeline
    pub fn render(&self) -> Vec<f32> {
        let rate = self.sample_rate as f64;
        let total = self
            .voices
            .values()
            .map(Self::audible_end)
            .fold(0.0_f64, f64::max);
        let mut timeline = vec![0.0_f32; (total * rate).ceil() as usize];

        for voice in self.voices.values() {
            let samples = voice.buffer.mono_at(self.sample_rate);
            let first = (voice.start * rate).round() as usize;
            let audible = ((Self::audible_end(voice) - voice.start) * rate).round() as usize;

            for (offset, sample) in samples.iter().take(audible).enumerate() {
                if let Some(slot) = timeline.get_mut(first + offset) {
                    *slot += sample;
                }
            }
        }

        timeline
    }

    fn audible_end(voice: &Voice) -> f64 {
        let end = voice.start + voice.buffer.duration();
        match voice.stopped_at {
            Some(at) => at.clamp(voice.start, end),
            None => end,
        }
    }

    fn write_recording(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;

        let timeline = self.render();
        for sample in &timeline {
            writer
                .write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)
                .context("Failed to write sample to WAV")?;
        }
        writer.finalize().context("Failed to finalize WAV file")?;

        info!(
            "Recorded {:.1}s of playback to {}",
            timeline.len() as f64 / self.sample_rate as f64,
            path.display()
        );

        Ok(())
    }
}

impl OutputContext for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start_at(&mut self, buffer: &PcmBuffer, when: f64) -> SourceHandle {
        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;

        if self.closed {
            warn!("Buffer started on a closed output context; it will not play");
        }

        self.prune();

        self.log.push(PlaybackRecord {
            handle,
            start: when,
            duration: buffer.duration(),
            stopped_at: None,
        });
        self.voices.insert(
            handle,
            Voice {
                buffer: buffer.clone(),
                start: when,
                stopped_at: None,
            },
        );

        debug!(
            "Scheduled buffer {:?} at {:.3}s ({:.3}s long)",
            handle,
            when,
            buffer.duration()
        );

        handle
    }

    fn stop(&mut self, handle: SourceHandle) {
        let now = self.clock.now();
        if let Some(voice) = self.voices.get_mut(&handle) {
            if voice.stopped_at.is_none() {
                voice.stopped_at = Some(now);
                self.log.mark_stopped(handle, now);
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(path) = self.record_path.clone() {
            if let Err(e) = self.write_recording(&path) {
                warn!("Failed to record playback: {}", e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Opens `VirtualOutput`s that share one clock and one playback log
#[derive(Debug, Clone)]
pub struct VirtualOutputFactory {
    clock: Clock,
    log: PlaybackLog,
    record_path: Option<PathBuf>,
}

impl VirtualOutputFactory {
    pub fn wall_clock() -> Self {
        Self {
            clock: Clock::Wall(Instant::now()),
            log: PlaybackLog::bounded(WALL_CLOCK_LOG_LIMIT),
            record_path: None,
        }
    }

    pub fn manual(clock: ManualClock) -> Self {
        Self {
            clock: Clock::Manual(clock),
            log: PlaybackLog::default(),
            record_path: None,
        }
    }

    pub fn with_recording(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn log(&self) -> PlaybackLog {
        self.log.clone()
    }
}

impl OutputFactory for VirtualOutputFactory {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        // Each context gets a fresh clock origin, like a newly created audio context.
        let clock = match &self.clock {
            Clock::Wall(_) => Clock::Wall(Instant::now()),
            Clock::Manual(clock) => Clock::Manual(clock.clone()),
        };

        let mut output = VirtualOutput::with_clock(sample_rate, clock, self.log.clone());
        output.record_path = self.record_path.clone();

        info!("Opened virtual output context ({}Hz)", sample_rate);
        Ok(Box::new(output))
    }
}
