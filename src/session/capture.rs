use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{
    encode_audio_frame, AudioFrame, CaptureConstraints, DeviceHandle, MicrophoneSource,
    MicrophoneStream,
};
use crate::error::LiveResult;
use crate::transport::FrameSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Inactive,
    Acquiring,
    Active,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Microphone → encoder → transport
///
/// The pipeline never buffers frames. Blocks captured while no transport is
/// attached are discarded; realtime audio is best-effort.
pub struct CapturePipeline {
    state: CaptureState,
    sample_rate: u32,
    device: Option<DeviceHandle>,
    pump: Option<JoinHandle<()>>,
    sink: watch::Sender<Option<FrameSender>>,
    counters: Arc<CaptureCounters>,
}

impl CapturePipeline {
    pub fn new(sample_rate: u32) -> Self {
        let (sink, _) = watch::channel(None);

        Self {
            state: CaptureState::Inactive,
            sample_rate,
            device: None,
            pump: None,
            sink,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Acquire the microphone and start pulling blocks.
    pub async fn acquire(
        &mut self,
        source: &dyn MicrophoneSource,
        constraints: &CaptureConstraints,
    ) -> LiveResult<()> {
        self.begin_acquire();
        match source.acquire(constraints).await {
            Ok(stream) => {
                self.activate(stream);
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Mark a device request as pending
    pub fn begin_acquire(&mut self) {
        self.stop();
        self.state = CaptureState::Acquiring;
    }

    /// Device request denied or failed; nothing is retried.
    pub fn fail(&mut self) {
        self.stop();
    }

    /// Take ownership of an acquired microphone and start the pump
    pub fn activate(&mut self, stream: MicrophoneStream) {
        self.stop();

        let MicrophoneStream { blocks, device } = stream;
        info!("Capture active on {}", device.label());

        self.counters = Arc::new(CaptureCounters::default());
        self.pump = Some(tokio::spawn(Self::pump(
            blocks,
            self.sink.subscribe(),
            Arc::clone(&self.counters),
            self.sample_rate,
        )));
        self.device = Some(device);
        self.state = CaptureState::Active;
    }

    async fn pump(
        mut blocks: mpsc::Receiver<Vec<f32>>,
        sink: watch::Receiver<Option<FrameSender>>,
        counters: Arc<CaptureCounters>,
        sample_rate: u32,
    ) {
        let started = Instant::now();

        while let Some(block) = blocks.recv().await {
            let frame = AudioFrame::from_f32(&block, sample_rate)
                .with_timestamp(started.elapsed().as_millis() as u64);
            let target = sink.borrow().clone();

            let delivered = match target {
                Some(sender) => sender.send(encode_audio_frame(&frame)),
                None => false,
            };

            if delivered {
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dropped frame at {}ms ({} samples): no open transport",
                    frame.timestamp_ms,
                    frame.samples.len()
                );
            }
        }

        debug!("Capture stream ended");
    }

    /// Start forwarding frames to `sender`
    pub fn attach(&mut self, sender: FrameSender) {
        if self.state != CaptureState::Active {
            warn!("Attaching transport to an inactive capture pipeline");
        }
        self.sink.send_replace(Some(sender));
    }

    pub fn detach(&mut self) {
        self.sink.send_replace(None);
    }

    /// Release the device and detach the pump. Safe from any state.
    pub fn stop(&mut self) {
        self.detach();

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(mut device) = self.device.take() {
            device.stop();
        }

        if self.state != CaptureState::Inactive {
            info!(
                "Capture stopped ({} frames forwarded, {} dropped)",
                self.frames_forwarded(),
                self.frames_dropped()
            );
        }
        self.state = CaptureState::Inactive;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.counters.forwarded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
