// Integration tests for the session transport
//
// Exercise queuing, event delivery and cancellation against a fake endpoint.

mod common;

use anyhow::Result;
use common::{next_remote, FakeConnector, TIMEOUT};
use gemilive::audio::encode_frame;
use gemilive::session::SessionConfig;
use gemilive::transport::{LiveSetup, ServerMessage, SessionTransport, TransportEvent};
use std::time::Duration;
use tokio::sync::mpsc;

fn open(
    connector: std::sync::Arc<FakeConnector>,
) -> (SessionTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let setup = LiveSetup::from(&SessionConfig::default());
    let transport = SessionTransport::open(connector, setup, move |event| {
        let _ = tx.send(event);
    });
    (transport, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<TransportEvent> {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event stream ended"))
}

#[tokio::test]
async fn test_frames_queued_before_open_are_delivered_in_order() -> Result<()> {
    let (connector, mut remotes) = FakeConnector::new();
    let (transport, mut events) = open(connector);

    let first = encode_frame(&[0.1; 8]);
    let second = encode_frame(&[0.2; 8]);
    assert!(transport.send(first.clone()));
    assert!(transport.sender().send(second.clone()));

    let mut remote = next_remote(&mut remotes).await?;
    assert_eq!(next_event(&mut events).await?, TransportEvent::Open);

    assert_eq!(remote.frames.recv().await, Some(first));
    assert_eq!(remote.frames.recv().await, Some(second));
    Ok(())
}

#[tokio::test]
async fn test_inbound_messages_are_forwarded_in_order() -> Result<()> {
    let (connector, mut remotes) = FakeConnector::new();
    let (_transport, mut events) = open(connector);

    let remote = next_remote(&mut remotes).await?;
    assert_eq!(next_event(&mut events).await?, TransportEvent::Open);

    for text in ["one", "two", "three"] {
        remote
            .send(ServerMessage {
                output_transcription: Some(text.to_string()),
                ..Default::default()
            })
            .await;
    }

    for text in ["one", "two", "three"] {
        match next_event(&mut events).await? {
            TransportEvent::Message(message) => {
                assert_eq!(message.output_transcription.as_deref(), Some(text))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_remote_going_away_is_close() -> Result<()> {
    let (connector, mut remotes) = FakeConnector::new();
    let (transport, mut events) = open(connector);

    let remote = next_remote(&mut remotes).await?;
    assert_eq!(next_event(&mut events).await?, TransportEvent::Open);

    let closed = remote.closed.clone();
    drop(remote);

    assert_eq!(next_event(&mut events).await?, TransportEvent::Close(None));
    assert!(!transport.is_closed());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_connect_failure_is_error() -> Result<()> {
    let (_transport, mut events) = open(FakeConnector::refusing("no route to bridge"));

    match next_event(&mut events).await? {
        TransportEvent::Error(message) => assert!(message.contains("no route to bridge")),
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_close_cancels_pending_connect() -> Result<()> {
    let (connector, mut remotes, gate) = FakeConnector::gated();
    let (mut transport, mut events) = open(connector.clone());

    tokio::time::timeout(TIMEOUT, connector.connect_started.notified()).await?;

    transport.close();
    transport.close();
    assert!(transport.is_closed());

    let _ = gate.send(());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(events.try_recv().is_err(), "no event after close");
    assert!(remotes.try_recv().is_err(), "connection never established");
    Ok(())
}

#[tokio::test]
async fn test_close_hangs_up_open_connection() -> Result<()> {
    let (connector, mut remotes) = FakeConnector::new();
    let (mut transport, mut events) = open(connector);

    let remote = next_remote(&mut remotes).await?;
    assert_eq!(next_event(&mut events).await?, TransportEvent::Open);

    transport.close();

    tokio::time::timeout(TIMEOUT, async {
        while !remote.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    // A local hangup is not reported back
    assert!(events.try_recv().is_err());
    Ok(())
}
