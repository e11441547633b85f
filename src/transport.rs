//! Session transport
//!
//! One persistent duplex connection to the live model. Outbound frames are
//! queued from the moment the transport is opened and flushed once the remote
//! end acknowledges; inbound traffic is surfaced as `TransportEvent`s through
//! a single callback, in arrival order.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::audio::EncodedFrame;
use crate::session::SessionConfig;

/// Parameters sent to the remote end when a session is set up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSetup {
    pub session_id: String,
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl From<&SessionConfig> for LiveSetup {
    fn from(config: &SessionConfig) -> Self {
        Self {
            session_id: config.session_id.clone(),
            model: config.model.clone(),
            system_instruction: config.system_instruction.clone(),
            voice: config.voice.clone(),
            input_sample_rate: config.capture_sample_rate,
            output_sample_rate: config.playback_sample_rate,
        }
    }
}

/// One inbound message. Every field is optional; a message can carry several.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    /// Base64 PCM at the playback rate
    pub audio: Option<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The remote end acknowledged the session
    Open,
    Message(ServerMessage),
    Error(String),
    /// The remote end hung up
    Close(Option<String>),
}

/// An established connection to the live model
#[async_trait::async_trait]
pub trait LiveConnection: Send + Sync {
    async fn send_frame(&self, frame: EncodedFrame) -> Result<()>;

    /// Best-effort hangup
    async fn close(&self);
}

/// Remote conversational endpoint
///
/// `connect` resolves once the remote end acknowledged the setup. Inbound
/// traffic arrives on the returned receiver; the receiver ending means the
/// connection is gone.
#[async_trait::async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        setup: &LiveSetup,
    ) -> Result<(Box<dyn LiveConnection>, mpsc::Receiver<TransportEvent>)>;
}

/// Cloneable handle for pushing outbound frames
#[derive(Debug, Clone)]
pub struct FrameSender(mpsc::UnboundedSender<EncodedFrame>);

impl FrameSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EncodedFrame>) -> Self {
        Self(tx)
    }

    /// Queue a frame. Returns false once the transport is gone.
    pub fn send(&self, frame: EncodedFrame) -> bool {
        self.0.send(frame).is_ok()
    }
}

pub struct SessionTransport {
    outbound: FrameSender,
    close_tx: Option<oneshot::Sender<()>>,
}

impl SessionTransport {
    /// Start connecting. Events, including `Open`, are delivered to `on_event`.
    pub fn open<F>(connector: Arc<dyn LiveConnector>, setup: LiveSetup, on_event: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(Self::run(connector, setup, outbound_rx, close_rx, on_event));

        Self {
            outbound: FrameSender::new(outbound_tx),
            close_tx: Some(close_tx),
        }
    }

    async fn run<F>(
        connector: Arc<dyn LiveConnector>,
        setup: LiveSetup,
        mut outbound: mpsc::UnboundedReceiver<EncodedFrame>,
        mut close_rx: oneshot::Receiver<()>,
        on_event: F,
    ) where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        info!("Connecting live session {} ({})", setup.session_id, setup.model);

        let connected = tokio::select! {
            biased;

            _ = &mut close_rx => {
                info!("Transport closed before connection resolved");
                return;
            }
            result = connector.connect(&setup) => result,
        };

        let (connection, mut inbound) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Live connection failed: {:#}", e);
                on_event(TransportEvent::Error(format!("{:#}", e)));
                return;
            }
        };

        info!("Live session {} open", setup.session_id);
        on_event(TransportEvent::Open);

        let mut frames_sent: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = &mut close_rx => {
                    debug!("Transport close requested");
                    break;
                }

                Some(frame) = outbound.recv() => {
                    if let Err(e) = connection.send_frame(frame).await {
                        warn!("Failed to send frame: {:#}", e);
                        on_event(TransportEvent::Error(format!("{:#}", e)));
                        break;
                    }
                    frames_sent += 1;
                }

                event = inbound.recv() => match event {
                    Some(event) => {
                        let terminal = matches!(
                            event,
                            TransportEvent::Error(_) | TransportEvent::Close(_)
                        );
                        on_event(event);
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        on_event(TransportEvent::Close(None));
                        break;
                    }
                },
            }
        }

        connection.close().await;
        info!(
            "Live session {} transport finished ({} frames sent)",
            setup.session_id, frames_sent
        );
    }

    pub fn sender(&self) -> FrameSender {
        self.outbound.clone()
    }

    /// Queue a frame; delivered once the connection is open.
    pub fn send(&self, frame: EncodedFrame) -> bool {
        self.outbound.send(frame)
    }

    /// Hang up without waiting for the remote end. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.is_none()
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.close();
    }
}
