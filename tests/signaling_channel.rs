mod common;

use common::{eventually, setup, test_config, MemoryRelay, WAIT};
use roomcall::peer::SessionDescription;
use roomcall::signaling::{
    ClientMessage, SignalSink, SignalingChannel, SignalingEvent, SignalingEvents,
};
use roomcall::{SignalingConnectionState, TransportError};
use std::time::Duration;

async fn wait_state(channel: &SignalingChannel, want: SignalingConnectionState) {
    let mut rx = channel.watch_state();
    let reached = tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "channel never reached {want:?}, stuck in {:?}",
        channel.state()
    );
}

async fn drain(events: &mut SignalingEvents) -> Vec<SignalingEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(30), events.recv()).await
    {
        out.push(event);
    }
    out
}

fn joins(relay: &MemoryRelay, room: &str) -> Vec<String> {
    relay
        .received()
        .into_iter()
        .filter(|(_, msg)| matches!(msg, ClientMessage::JoinRoom(r) if r == room))
        .map(|(from, _)| from)
        .collect()
}

#[tokio::test]
async fn transport_drop_reconnects_and_rejoins_room() {
    setup();
    let relay = MemoryRelay::new();
    let (channel, mut events) =
        SignalingChannel::connect("ws://relay.test", test_config().reconnect, relay.clone());
    channel.join_room("demo").unwrap();

    wait_state(&channel, SignalingConnectionState::Connected).await;
    eventually("joined", || relay.members("demo") == vec!["peer-1".to_string()]).await;

    relay.drop_client("peer-1");
    eventually("rejoined", || relay.members("demo") == vec!["peer-2".to_string()]).await;
    assert_eq!(channel.state(), SignalingConnectionState::Connected);
    assert_eq!(joins(&relay, "demo"), vec!["peer-1", "peer-2"]);

    let events = drain(&mut events).await;
    assert!(events.contains(&SignalingEvent::State(
        SignalingConnectionState::Reconnecting
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, SignalingEvent::Error(TransportError::Dropped(_)))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SignalingEvent::Message(_))));
    channel.close();
}

#[tokio::test]
async fn server_close_reconnects_after_restart_delay() {
    setup();
    let relay = MemoryRelay::new();
    let (channel, _events) =
        SignalingChannel::connect("ws://relay.test", test_config().reconnect, relay.clone());
    channel.join_room("demo").unwrap();
    eventually("joined", || relay.members("demo").len() == 1).await;

    relay.server_close("peer-1");
    eventually("rejoined", || relay.members("demo") == vec!["peer-2".to_string()]).await;
    assert_eq!(relay.connects(), 2);
    channel.close();
}

#[tokio::test]
async fn messages_sent_offline_are_flushed_after_join() {
    setup();
    let relay = MemoryRelay::new();
    relay.set_refuse(true);
    let mut reconnect = test_config().reconnect;
    reconnect.max_attempts = 100;
    let (channel, _events) = SignalingChannel::connect("ws://relay.test", reconnect, relay.clone());

    channel.join_room("demo").unwrap();
    channel
        .send(ClientMessage::Offer {
            offer: SessionDescription::offer("v=0"),
            target: "peer-x".into(),
        })
        .unwrap();
    wait_state(&channel, SignalingConnectionState::Reconnecting).await;

    relay.set_refuse(false);
    wait_state(&channel, SignalingConnectionState::Connected).await;
    eventually("outbox flushed", || relay.count("offer") == 1).await;

    let events: Vec<&str> = relay
        .sent_by("peer-1")
        .iter()
        .map(|m| m.event())
        .collect();
    assert_eq!(events, vec!["join-room", "offer"]);
    channel.close();
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    setup();
    let relay = MemoryRelay::new();
    relay.set_refuse(true);
    let (channel, mut events) =
        SignalingChannel::connect("ws://relay.test", test_config().reconnect, relay.clone());

    wait_state(&channel, SignalingConnectionState::Failed).await;
    let events = drain(&mut events).await;
    assert!(events.contains(&SignalingEvent::Error(TransportError::RetriesExhausted(2))));
    assert_eq!(
        events.last(),
        Some(&SignalingEvent::State(SignalingConnectionState::Failed))
    );
    assert_eq!(relay.connects(), 0);
    assert_eq!(channel.join_room("demo"), Err(TransportError::Closed));
}

#[tokio::test]
async fn close_leaves_room_and_stops_reconnecting() {
    setup();
    let relay = MemoryRelay::new();
    let (channel, _events) =
        SignalingChannel::connect("ws://relay.test", test_config().reconnect, relay.clone());
    channel.join_room("demo").unwrap();
    eventually("joined", || relay.members("demo").len() == 1).await;

    channel.close();
    wait_state(&channel, SignalingConnectionState::Disconnected).await;
    assert!(relay.members("demo").is_empty());
    assert_eq!(relay.sent_by("peer-1").last(), Some(&ClientMessage::Leave));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.connects(), 1);
}
