// Shared fakes for session tests
//
// A scripted microphone and a scripted live endpoint, so the controller can be
// driven end to end without audio hardware or a NATS server.

#![allow(dead_code)]

use anyhow::{bail, Result};
use base64::Engine;
use gemilive::audio::{
    CaptureConstraints, DeviceGuard, DeviceHandle, EncodedFrame, ManualClock, MicrophoneSource,
    MicrophoneStream, VirtualOutputFactory,
};
use gemilive::session::{LiveSession, SessionConfig, SessionDeps, SessionSnapshot, SessionStatus};
use gemilive::transport::{LiveConnection, LiveConnector, LiveSetup, ServerMessage, TransportEvent};
use gemilive::{LiveError, LiveResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

pub const TIMEOUT: Duration = Duration::from_secs(2);

struct ReleaseFlag(Arc<AtomicBool>);

impl DeviceGuard for ReleaseFlag {
    fn release(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Microphone whose blocks are pushed by the test
pub struct FakeMicrophone {
    deny: bool,
    acquisitions: AtomicUsize,
    released: Mutex<Vec<Arc<AtomicBool>>>,
    feed: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            acquisitions: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            feed: Mutex::new(None),
        })
    }

    /// A microphone the user refuses access to
    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            acquisitions: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            feed: Mutex::new(None),
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Whether every device handed out so far has been released
    pub fn all_released(&self) -> bool {
        self.released
            .lock()
            .unwrap()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }

    /// Push one captured block into the current stream
    pub async fn speak(&self, block: Vec<f32>) -> bool {
        let feed = self.feed.lock().unwrap().clone();
        match feed {
            Some(feed) => feed.send(block).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl MicrophoneSource for FakeMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> LiveResult<MicrophoneStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(LiveError::device("permission denied"));
        }

        let (tx, rx) = mpsc::channel(16);
        *self.feed.lock().unwrap() = Some(tx);

        let released = Arc::new(AtomicBool::new(false));
        self.released.lock().unwrap().push(Arc::clone(&released));

        assert_eq!(constraints.channels, 1);

        Ok(MicrophoneStream {
            blocks: rx,
            device: DeviceHandle::new("fake-mic", ReleaseFlag(released)),
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// The far side of one fake connection
pub struct RemoteEnd {
    pub setup: LiveSetup,
    pub events: mpsc::Sender<TransportEvent>,
    pub frames: mpsc::UnboundedReceiver<EncodedFrame>,
    pub closed: Arc<AtomicBool>,
}

impl RemoteEnd {
    pub async fn send(&self, message: ServerMessage) {
        let _ = self.events.send(TransportEvent::Message(message)).await;
    }

    pub async fn send_audio(&self, seconds: f64) {
        self.send(ServerMessage {
            audio: Some(pcm_payload(seconds)),
            ..Default::default()
        })
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeConnection {
    frames: mpsc::UnboundedSender<EncodedFrame>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl LiveConnection for FakeConnection {
    async fn send_frame(&self, frame: EncodedFrame) -> Result<()> {
        if self.frames.send(frame).is_err() {
            bail!("remote end went away");
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Live endpoint that hands every accepted connection to the test
pub struct FakeConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    refuse: Option<String>,
    connects: AtomicUsize,
    pub connect_started: Notify,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::build(None, None)
    }

    /// The first connect stays pending until the returned sender fires
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>, oneshot::Sender<()>) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (connector, remotes) = Self::build(Some(gate_rx), None);
        (connector, remotes, gate_tx)
    }

    pub fn refusing(reason: &str) -> Arc<Self> {
        Self::build(None, Some(reason.to_string())).0
    }

    fn build(
        gate: Option<oneshot::Receiver<()>>,
        refuse: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            remotes: tx,
            gate: Mutex::new(gate),
            refuse,
            connects: AtomicUsize::new(0),
            connect_started: Notify::new(),
        });
        (connector, rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(
        &self,
        setup: &LiveSetup,
    ) -> Result<(Box<dyn LiveConnection>, mpsc::Receiver<TransportEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_started.notify_one();

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(reason) = &self.refuse {
            bail!("{}", reason);
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let _ = self.remotes.send(RemoteEnd {
            setup: setup.clone(),
            events: events_tx,
            frames: frames_rx,
            closed: Arc::clone(&closed),
        });

        Ok((Box::new(FakeConnection { frames: frames_tx, closed }), events_rx))
    }
}

/// Base64 PCM of `seconds` of a quiet tone at the playback rate
pub fn pcm_payload(seconds: f64) -> String {
    let samples = (seconds * 24000.0).round() as usize;
    let bytes: Vec<u8> = (0..samples)
        .flat_map(|i| (((i % 100) as i16) * 10).to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub struct Harness {
    pub session: LiveSession,
    pub microphone: Arc<FakeMicrophone>,
    pub connector: Arc<FakeConnector>,
    pub output: VirtualOutputFactory,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(microphone: Arc<FakeMicrophone>, connector: Arc<FakeConnector>) -> Self {
        let clock = ManualClock::new();
        let output = VirtualOutputFactory::manual(clock.clone());

        let deps = SessionDeps {
            microphone: microphone.clone(),
            connector: connector.clone(),
            output: Arc::new(output.clone()),
        };
        let session = LiveSession::spawn(SessionConfig::default(), deps);

        Self {
            session,
            microphone,
            connector,
            output,
            clock,
        }
    }

    pub async fn wait_for(&self, status: SessionStatus) -> Result<()> {
        tokio::time::timeout(TIMEOUT, self.session.wait_for_status(status)).await??;
        Ok(())
    }

    /// Poll snapshots until `condition` holds
    pub async fn wait_until<F>(&self, condition: F) -> Result<SessionSnapshot>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let snapshot = self.session.snapshot().await?;
            if condition(&snapshot) {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("condition not reached, last snapshot: {:?}", snapshot);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> Result<RemoteEnd> {
    match tokio::time::timeout(TIMEOUT, remotes.recv()).await? {
        Some(remote) => Ok(remote),
        None => bail!("connector dropped"),
    }
}
