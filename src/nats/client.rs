use anyhow::{bail, Context, Result};
use async_nats::Client;
use futures::stream::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::messages::{
    CloseNotice, RealtimeInputMessage, ServerMessageWire, SetupReply, SetupRequest,
};
use crate::audio::EncodedFrame;
use crate::transport::{LiveConnection, LiveConnector, LiveSetup, TransportEvent};

/// Subject the live bridge answers setup requests on
pub const SETUP_SUBJECT: &str = "live.setup";

pub fn input_subject(session_id: &str) -> String {
    format!("live.{}.input", session_id)
}

pub fn server_subject(session_id: &str) -> String {
    format!("live.{}.server", session_id)
}

pub fn close_subject(session_id: &str) -> String {
    format!("live.{}.close", session_id)
}

pub struct NatsClient {
    client: Client,
    session_id: String,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str, session_id: String) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client, session_id })
    }

    /// Ask the bridge to open a model session; resolves on acknowledgement
    pub async fn request_setup(&self, setup: &LiveSetup) -> Result<()> {
        let payload = serde_json::to_vec(&SetupRequest::from(setup))?;

        let reply = self
            .client
            .request(SETUP_SUBJECT.to_string(), payload.into())
            .await
            .context("Live bridge did not answer the setup request")?;

        let reply: SetupReply =
            serde_json::from_slice(&reply.payload).context("Malformed setup reply")?;

        if !reply.ok {
            bail!(
                "Live bridge rejected the session: {}",
                reply.error.unwrap_or_else(|| "no reason given".to_string())
            );
        }

        info!("Live bridge accepted session {}", self.session_id);
        Ok(())
    }

    /// Publish one microphone frame
    pub async fn publish_input(&self, frame: EncodedFrame, sequence: u64) -> Result<()> {
        let subject = input_subject(&self.session_id);

        let message = RealtimeInputMessage {
            session_id: self.session_id.clone(),
            sequence,
            media: frame,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish audio frame")?;

        debug!("Published audio frame to {} (seq={})", subject, sequence);

        Ok(())
    }

    /// Subscribe to messages relayed from the model
    pub async fn subscribe_server(&self) -> Result<async_nats::Subscriber> {
        let subject = server_subject(&self.session_id);

        info!("Subscribing to server messages on {}", subject);

        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .context("Failed to subscribe to server messages")?;

        Ok(subscriber)
    }

    /// Tell the bridge this side hung up
    pub async fn publish_close(&self, reason: Option<String>) -> Result<()> {
        let notice = CloseNotice {
            session_id: self.session_id.clone(),
            reason,
        };
        let payload = serde_json::to_vec(&notice)?;

        self.client
            .publish(close_subject(&self.session_id), payload.into())
            .await
            .context("Failed to publish close notice")?;
        self.client.flush().await.context("Failed to flush NATS")?;

        Ok(())
    }
}

/// Reaches the live model through a NATS bridge
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl LiveConnector for NatsConnector {
    async fn connect(
        &self,
        setup: &LiveSetup,
    ) -> Result<(Box<dyn LiveConnection>, mpsc::Receiver<TransportEvent>)> {
        let client = Arc::new(NatsClient::connect(&self.url, setup.session_id.clone()).await?);

        // Subscribe before the handshake so the first reply cannot be missed.
        let mut subscriber = client.subscribe_server().await?;
        client.request_setup(setup).await?;

        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match serde_json::from_slice::<ServerMessageWire>(&msg.payload) {
                    Ok(wire) => {
                        let Some(event) = wire.into_event() else {
                            continue;
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse server message: {}", e);
                    }
                }
            }
            debug!("Server message subscription ended");
        });

        let connection = NatsConnection {
            client,
            sequence: AtomicU64::new(0),
            reader: reader.abort_handle(),
        };

        Ok((Box::new(connection), rx))
    }
}

struct NatsConnection {
    client: Arc<NatsClient>,
    sequence: AtomicU64,
    reader: AbortHandle,
}

#[async_trait::async_trait]
impl LiveConnection for NatsConnection {
    async fn send_frame(&self, frame: EncodedFrame) -> Result<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.client.publish_input(frame, seq).await
    }

    async fn close(&self) {
        self.reader.abort();
        if let Err(e) = self.client.publish_close(None).await {
            warn!("Failed to notify bridge of hangup: {:#}", e);
        }
        info!("Closed NATS live connection");
    }
}
