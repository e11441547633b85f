use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::capture::CapturePipeline;
use super::config::SessionConfig;
use super::scheduler::PlaybackScheduler;
use super::status::{SessionSnapshot, SessionStatus};
use super::transcript::{Transcript, TranscriptAssembler, TranscriptFragment};
use crate::audio::{decode_audio, MicrophoneSource, MicrophoneStream, OutputContext, OutputFactory};
use crate::error::{LiveError, LiveResult};
use crate::transport::{LiveConnector, LiveSetup, ServerMessage, SessionTransport, TransportEvent};

/// Collaborators a session talks to
#[derive(Clone)]
pub struct SessionDeps {
    pub microphone: Arc<dyn MicrophoneSource>,
    pub connector: Arc<dyn LiveConnector>,
    pub output: Arc<dyn OutputFactory>,
}

/// Everything the dispatch loop reacts to, in one channel
pub(crate) enum SessionEvent {
    Start {
        reply: oneshot::Sender<LiveResult<()>>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    DeviceAcquired {
        generation: u64,
        result: LiveResult<MicrophoneStream>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Shutdown,
}

/// Handle to a live voice session
///
/// Cheap to clone. All state lives in one dispatch task that handles user
/// commands and collaborator events strictly in arrival order. Dropping the
/// last handle tears the session down.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<SessionHandle>,
}

struct SessionHandle {
    session_id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    transcripts: watch::Receiver<Vec<Transcript>>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Shutdown);
    }
}

impl LiveSession {
    /// Create an idle session. Must be called inside a tokio runtime.
    pub fn spawn(config: SessionConfig, deps: SessionDeps) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (core, status, transcripts) = SessionCore::new(config, deps, events_tx.clone());
        let session_id = core.config.session_id.clone();

        tokio::spawn(async move {
            let mut core = core;
            while let Some(event) = events_rx.recv().await {
                if !core.handle(event) {
                    break;
                }
            }
            info!("Session {} controller stopped", core.config.session_id);
        });

        Self {
            inner: Arc::new(SessionHandle {
                session_id,
                events: events_tx,
                status,
                transcripts,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Begin a session. Accepted only from `Idle` or `Error`; the outcome of
    /// device acquisition and connection is reported through the status.
    pub async fn start(&self) -> LiveResult<()> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .events
            .send(SessionEvent::Start { reply })
            .map_err(|_| LiveError::Closed)?;
        rx.await.map_err(|_| LiveError::Closed)?
    }

    /// Tear everything down and go idle. Never fails, safe to repeat.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(SessionEvent::Stop { reply: Some(reply) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> LiveResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .events
            .send(SessionEvent::Snapshot { reply })
            .map_err(|_| LiveError::Closed)?;
        rx.await.map_err(|_| LiveError::Closed)
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.clone()
    }

    /// Transcript history, republished after every completed turn
    pub fn subscribe_transcripts(&self) -> watch::Receiver<Vec<Transcript>> {
        self.inner.transcripts.clone()
    }

    pub fn transcripts(&self) -> Vec<Transcript> {
        self.inner.transcripts.borrow().clone()
    }

    /// Wait until the session reports `target`
    pub async fn wait_for_status(&self, target: SessionStatus) -> LiveResult<()> {
        let mut status = self.subscribe_status();
        status
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| LiveError::Closed)
    }
}

/// State owned by the dispatch task
pub(crate) struct SessionCore {
    config: SessionConfig,
    deps: SessionDeps,
    events: mpsc::UnboundedSender<SessionEvent>,

    /// Bumped on every start and teardown; continuations carrying an older
    /// value belong to a session that no longer exists.
    generation: u64,

    status: watch::Sender<SessionStatus>,
    transcripts: watch::Sender<Vec<Transcript>>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,

    capture: CapturePipeline,
    transport: Option<SessionTransport>,
    output: Option<Box<dyn OutputContext>>,
    scheduler: PlaybackScheduler,
    assembler: TranscriptAssembler,

    chunks_played: u64,
    chunks_dropped: u64,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (
        Self,
        watch::Receiver<SessionStatus>,
        watch::Receiver<Vec<Transcript>>,
    ) {
        let (status, status_rx) = watch::channel(SessionStatus::Idle);
        let (transcripts, transcripts_rx) = watch::channel(Vec::new());
        let capture = CapturePipeline::new(config.capture_sample_rate);

        let core = Self {
            config,
            deps,
            events,
            generation: 0,
            status,
            transcripts,
            error: None,
            started_at: None,
            capture,
            transport: None,
            output: None,
            scheduler: PlaybackScheduler::new(),
            assembler: TranscriptAssembler::new(),
            chunks_played: 0,
            chunks_dropped: 0,
        };

        (core, status_rx, transcripts_rx)
    }

    /// Handle one event. Returns false when the loop should exit.
    pub(crate) fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Start { reply } => {
                let _ = reply.send(self.start());
            }
            SessionEvent::Stop { reply } => {
                self.stop();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            SessionEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionEvent::DeviceAcquired { generation, result } => {
                self.on_device(generation, result);
            }
            SessionEvent::Transport { generation, event } => {
                self.on_transport(generation, event);
            }
            SessionEvent::Shutdown => {
                info!("Session {} discarded, releasing resources", self.config.session_id);
                self.stop();
                return false;
            }
        }
        true
    }

    fn current_status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(
                "Session {} status: {} -> {}",
                self.config.session_id, previous, status
            );
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.current_status().is_active()
    }

    fn start(&mut self) -> LiveResult<()> {
        let status = self.current_status();
        if !status.can_start() {
            warn!("Ignoring start: session is {}", status);
            return Err(LiveError::InvalidState {
                action: "start",
                status,
            });
        }

        self.generation += 1;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.chunks_played = 0;
        self.chunks_dropped = 0;
        self.assembler.reset();
        self.transcripts.send_replace(Vec::new());
        self.set_status(SessionStatus::Connecting);

        info!(
            "Starting session {} (generation {})",
            self.config.session_id, self.generation
        );

        self.capture.begin_acquire();

        let microphone = Arc::clone(&self.deps.microphone);
        let constraints = self.config.capture_constraints();
        let events = self.events.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let result = microphone.acquire(&constraints).await;
            // If the controller is gone the stream is dropped here, which releases the device.
            let _ = events.send(SessionEvent::DeviceAcquired { generation, result });
        });

        Ok(())
    }

    fn on_device(&mut self, generation: u64, result: LiveResult<MicrophoneStream>) {
        if !self.is_current(generation) {
            if let Ok(mut stream) = result {
                info!("Releasing microphone acquired for a stale session");
                stream.device.stop();
            }
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.capture.activate(stream);

        let output = match self.deps.output.open(self.config.playback_sample_rate) {
            Ok(output) => output,
            Err(e) => {
                self.fail(LiveError::output(format!("{:#}", e)));
                return;
            }
        };
        self.output = Some(output);

        let mut setup = LiveSetup::from(&self.config);
        setup.session_id = format!("{}-{}", self.config.session_id, self.generation);

        let events = self.events.clone();
        self.transport = Some(SessionTransport::open(
            Arc::clone(&self.deps.connector),
            setup,
            move |event| {
                let _ = events.send(SessionEvent::Transport { generation, event });
            },
        ));
    }

    fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        if !self.is_current(generation) {
            debug!("Dropping transport event from a stale session: {:?}", event);
            return;
        }

        match event {
            TransportEvent::Open => {
                if self.current_status() != SessionStatus::Connecting {
                    return;
                }
                if let Some(transport) = &self.transport {
                    self.capture.attach(transport.sender());
                }
                self.set_status(SessionStatus::Listening);
            }
            TransportEvent::Message(message) => self.dispatch(message),
            TransportEvent::Error(message) => self.fail(LiveError::connection(message)),
            TransportEvent::Close(reason) => {
                info!(
                    "Remote ended session {}: {}",
                    self.config.session_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown();
                self.set_status(SessionStatus::Idle);
            }
        }
    }

    fn dispatch(&mut self, message: ServerMessage) {
        if let Some(text) = message.output_transcription {
            self.assembler.push(TranscriptFragment::output(text));
        }
        if let Some(text) = message.input_transcription {
            self.assembler.push(TranscriptFragment::input(text));
        }

        if message.turn_complete && !self.assembler.complete_turn().is_empty() {
            self.transcripts.send_replace(self.assembler.history().to_vec());
        }

        if let Some(payload) = message.audio {
            self.play_chunk(&payload);
        }

        if message.interrupted {
            if let Some(output) = self.output.as_mut() {
                self.scheduler.interrupt(&mut **output);
            }
        }
    }

    fn play_chunk(&mut self, payload: &str) {
        let Some(output) = self.output.as_mut() else {
            return;
        };

        match decode_audio(payload, &**output, self.config.playback_sample_rate, 1) {
            Ok(buffer) => {
                self.scheduler.schedule(&mut **output, &buffer);
                self.chunks_played += 1;
            }
            Err(e) => {
                warn!("Dropping reply chunk: {}", e);
                self.chunks_dropped += 1;
            }
        }
    }

    fn fail(&mut self, error: LiveError) {
        error!("Session {} failed: {}", self.config.session_id, error);
        self.teardown();
        self.error = Some(error.user_message());
        self.set_status(SessionStatus::Error);
    }

    fn stop(&mut self) {
        self.teardown();
        self.set_status(SessionStatus::Idle);
    }

    /// Release every owned resource. Idempotent.
    fn teardown(&mut self) {
        self.generation += 1;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.capture.stop();
        self.scheduler.clear();
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }

    fn snapshot(&mut self) -> SessionSnapshot {
        if let Some(output) = &self.output {
            self.scheduler.reap(output.current_time());
        }

        SessionSnapshot {
            session_id: self.config.session_id.clone(),
            status: self.current_status(),
            error: self.error.clone(),
            started_at: self.started_at,
            transcripts: self.assembler.history().to_vec(),
            frames_sent: self.capture.frames_forwarded(),
            frames_dropped: self.capture.frames_dropped(),
            chunks_played: self.chunks_played,
            chunks_dropped: self.chunks_dropped,
            buffers_in_flight: self.scheduler.in_flight().len(),
            next_start_time: self.scheduler.next_start_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        CaptureConstraints, DeviceGuard, DeviceHandle, VirtualOutputFactory,
    };
    use crate::transport::LiveConnection;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    impl DeviceGuard for Flag {
        fn release(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct PendingMicrophone;

    #[async_trait::async_trait]
    impl MicrophoneSource for PendingMicrophone {
        async fn acquire(&self, _: &CaptureConstraints) -> LiveResult<MicrophoneStream> {
            futures::future::pending().await
        }

        fn name(&self) -> &str {
            "pending"
        }
    }

    struct PendingConnector;

    #[async_trait::async_trait]
    impl LiveConnector for PendingConnector {
        async fn connect(
            &self,
            _: &LiveSetup,
        ) -> anyhow::Result<(Box<dyn LiveConnection>, mpsc::Receiver<TransportEvent>)> {
            futures::future::pending().await
        }
    }

    fn core() -> SessionCore {
        let (tx, _rx) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            microphone: Arc::new(PendingMicrophone),
            connector: Arc::new(PendingConnector),
            output: Arc::new(VirtualOutputFactory::wall_clock()),
        };
        SessionCore::new(SessionConfig::default(), deps, tx).0
    }

    fn stream(released: &Arc<AtomicBool>) -> MicrophoneStream {
        let (_tx, blocks) = mpsc::channel(1);
        MicrophoneStream {
            blocks,
            device: DeviceHandle::new("test", Flag(Arc::clone(released))),
        }
    }

    #[tokio::test]
    async fn stale_open_does_not_resurrect_stopped_session() {
        let mut core = core();
        core.start().unwrap();
        let stale = core.generation;

        core.stop();
        core.on_transport(stale, TransportEvent::Open);

        assert_eq!(core.current_status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn stale_open_does_not_attach_to_newer_session() {
        let mut core = core();
        core.start().unwrap();
        let stale = core.generation;
        core.stop();
        core.start().unwrap();

        core.on_transport(stale, TransportEvent::Open);

        assert_eq!(core.current_status(), SessionStatus::Connecting);
    }

    #[tokio::test]
    async fn stale_device_is_released() {
        let mut core = core();
        core.start().unwrap();
        let stale = core.generation;
        core.stop();

        let released = Arc::new(AtomicBool::new(false));
        core.on_device(stale, Ok(stream(&released)));

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(core.current_status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn start_is_rejected_while_active() {
        let mut core = core();
        core.start().unwrap();

        let err = core.start().unwrap_err();
        assert_eq!(
            err,
            LiveError::InvalidState {
                action: "start",
                status: SessionStatus::Connecting
            }
        );
    }

    #[tokio::test]
    async fn device_failure_moves_to_error_with_user_message() {
        let mut core = core();
        core.start().unwrap();
        let generation = core.generation;

        core.on_device(generation, Err(LiveError::device("permission denied")));

        assert_eq!(core.current_status(), SessionStatus::Error);
        let snapshot = core.snapshot();
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Could not access the microphone. Check permissions.")
        );
        // Error is restartable
        assert!(core.start().is_ok());
    }
}
