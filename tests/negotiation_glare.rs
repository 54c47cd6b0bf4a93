//! End-to-end negotiation tests over in-memory signaling and transports:
//! the happy path, both sides of a glare collision, candidate queueing, and
//! bounded reconnects.

use std::sync::Arc;
use std::time::Duration;

use crabconnect::config::{NegotiationConfig, StatsConfig};
use crabconnect::media::{
    IceCandidate, MediaTrack, PeerTransport, RtcConfig, SessionDescription, SignalingState,
    TrackKind, TransportState,
};
use crabconnect::negotiation::{EngineEvent, NegotiationEngine};
use crabconnect::signaling::{kinds, SignalEnvelope, SignalingTransport};
use crabconnect::testing::{
    MockMediaSource, MockPeerTransport, MockTransportFactory, SignalingHub,
};
use crabconnect::types::{ConnectionState, PeerIdentity};

fn test_negotiation_config() -> NegotiationConfig {
    NegotiationConfig {
        offer_wait_ms: 100,
        max_reconnect_attempts: 2,
        mobile_reconnect_delay_ms: 10,
        desktop_reconnect_step_ms: 10,
        data_channel_label: "chat".to_string(),
    }
}

fn test_stats_config() -> StatsConfig {
    StatsConfig {
        sample_interval_ms: 25,
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Peer {
    engine: Arc<NegotiationEngine>,
    events: tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
    transport: MockPeerTransport,
    media: Arc<MockMediaSource>,
}

fn build_peer(hub: &Arc<SignalingHub>, local: &str, remote: &str, label: &str) -> Peer {
    let transport = MockPeerTransport::new(label);
    let factory = MockTransportFactory::new();
    factory.push_scripted(transport.clone());
    let media = MockMediaSource::new();

    let (engine, events) = NegotiationEngine::new(
        "session-1",
        PeerIdentity::new(local, local.to_uppercase()),
        remote,
        hub.transport(local),
        factory,
        Arc::clone(&media) as Arc<dyn crabconnect::media::MediaSource>,
        RtcConfig::default(),
        test_negotiation_config(),
        test_stats_config(),
        false,
    );

    Peer {
        engine,
        events,
        transport,
        media,
    }
}

async fn drain_until_connected(events: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), events.recv()).await {
            Ok(Some(EngineEvent::Connected)) => return,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event stream closed before Connected"),
            Err(_) => panic!("timed out waiting for Connected"),
        }
    }
}

#[tokio::test]
async fn test_two_peers_connect_and_chat() {
    let hub = SignalingHub::new();
    let mut a = build_peer(&hub, "a", "b", "ta");
    let mut b = build_peer(&hub, "b", "a", "tb");
    MockPeerTransport::link(&a.transport, &b.transport);

    b.engine.initialize().await.unwrap();
    a.engine.initialize().await.unwrap();

    drain_until_connected(&mut a.events).await;
    drain_until_connected(&mut b.events).await;
    assert_eq!(a.engine.state().await, ConnectionState::Connected);
    assert_eq!(b.engine.state().await, ConnectionState::Connected);

    // Chat flows over the data channel with a local echo on the sender.
    let sent = a.engine.send_message("hello").await.unwrap();
    assert_eq!(sent.from, "a");

    let received = loop {
        match tokio::time::timeout(Duration::from_secs(3), b.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            EngineEvent::Message(m) => break m,
            _ => continue,
        }
    };
    assert_eq!(received.id, sent.id);
    assert_eq!(received.text, "hello");

    let echo = loop {
        match tokio::time::timeout(Duration::from_secs(3), a.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            EngineEvent::Message(m) => break m,
            _ => continue,
        }
    };
    assert_eq!(echo.id, sent.id);

    // A mute toggle reaches the remote side out of band.
    let muted = a.engine.toggle_audio().await.unwrap();
    assert!(muted);
    assert!(!a.media.audio.is_enabled());

    loop {
        match tokio::time::timeout(Duration::from_secs(3), b.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            EngineEvent::RemoteMediaToggled { kind, enabled } => {
                assert_eq!(kind, TrackKind::Audio);
                assert!(!enabled);
                break;
            }
            _ => continue,
        }
    }

    a.engine.end_call().await.unwrap();
    b.engine.end_call().await.unwrap();
    assert!(a.media.audio.is_stopped());
    assert!(a.media.video.is_stopped());
}

#[tokio::test]
async fn test_impolite_peer_ignores_colliding_offer() {
    let hub = SignalingHub::new();
    // "a" < "b": peer a is the impolite initiator.
    let a = build_peer(&hub, "a", "b", "ta");

    let b_signaling = hub.transport("b");
    let _b_rx = b_signaling.subscribe().await.unwrap();

    a.engine.initialize().await.unwrap();
    b_signaling
        .send(SignalEnvelope::broadcast(
            kinds::PEER_JOINED,
            "b",
            serde_json::json!({ "displayName": "B" }),
        ))
        .await
        .unwrap();

    // Peer a offers once it sees b.
    let hub_for_offer = Arc::clone(&hub);
    wait_for(
        || !hub_for_offer.sent_of_kind(kinds::OFFER).is_empty(),
        "initial offer",
    )
    .await;
    assert_eq!(a.transport.signaling_state(), SignalingState::HaveLocalOffer);

    // A colliding offer from b lands while a's own offer is pending.
    b_signaling
        .send(SignalEnvelope::to_peer(
            kinds::OFFER,
            "b",
            "a",
            serde_json::to_value(SessionDescription::offer("offer-b-glare")).unwrap(),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The impolite side ignored it: no answer, local offer still pending.
    assert!(hub.sent_of_kind(kinds::ANSWER).is_empty());
    assert_eq!(a.transport.signaling_state(), SignalingState::HaveLocalOffer);

    // b yields and answers a's offer instead; a completes normally.
    b_signaling
        .send(SignalEnvelope::to_peer(
            kinds::ANSWER,
            "b",
            "a",
            serde_json::to_value(SessionDescription::answer("answer-b-0")).unwrap(),
        ))
        .await
        .unwrap();

    let transport = a.transport.clone();
    wait_for(
        || transport.connection_state() == TransportState::Connected,
        "connection after glare",
    )
    .await;
    assert_eq!(a.engine.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_polite_peer_rolls_back_and_answers() {
    let hub = SignalingHub::new();
    // "b" > "a": peer b is the polite responder.
    let b = build_peer(&hub, "b", "a", "tb");

    let a_signaling = hub.transport("a");
    let _a_rx = a_signaling.subscribe().await.unwrap();

    b.engine.initialize().await.unwrap();

    // Force a renegotiation so b has its own offer pending.
    b.transport.trigger_negotiation_needed();
    let transport = b.transport.clone();
    wait_for(
        || transport.signaling_state() == SignalingState::HaveLocalOffer,
        "renegotiation offer",
    )
    .await;

    // a's offer arrives mid-collision; the polite side rolls back and answers.
    a_signaling
        .send(SignalEnvelope::to_peer(
            kinds::OFFER,
            "a",
            "b",
            serde_json::to_value(SessionDescription::offer("offer-a-glare")).unwrap(),
        ))
        .await
        .unwrap();

    let hub_for_answer = Arc::clone(&hub);
    wait_for(
        || !hub_for_answer.sent_of_kind(kinds::ANSWER).is_empty(),
        "answer after rollback",
    )
    .await;

    let answers = hub.sent_of_kind(kinds::ANSWER);
    assert_eq!(answers[0].from, "b");
    assert_eq!(b.transport.signaling_state(), SignalingState::Stable);
}

#[tokio::test]
async fn test_candidates_queue_until_remote_description() {
    let hub = SignalingHub::new();
    let b = build_peer(&hub, "b", "a", "tb");
    let a_signaling = hub.transport("a");

    b.engine.initialize().await.unwrap();

    let candidate = |n: u32| IceCandidate {
        candidate: format!("candidate:{}", n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    };

    // Candidates arrive before any description; they must not be applied yet.
    for n in 0..3 {
        a_signaling
            .send(SignalEnvelope::to_peer(
                kinds::ICE_CANDIDATE,
                "a",
                "b",
                serde_json::to_value(candidate(n)).unwrap(),
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.transport.applied_candidates().is_empty());

    // The offer flushes the queue in arrival order.
    a_signaling
        .send(SignalEnvelope::to_peer(
            kinds::OFFER,
            "a",
            "b",
            serde_json::to_value(SessionDescription::offer("offer-a-0")).unwrap(),
        ))
        .await
        .unwrap();

    let transport = b.transport.clone();
    wait_for(
        || transport.applied_candidates().len() == 3,
        "queued candidates flushed",
    )
    .await;
    let applied: Vec<String> = b
        .transport
        .applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied, vec!["candidate:0", "candidate:1", "candidate:2"]);

    // Later candidates skip the queue entirely.
    a_signaling
        .send(SignalEnvelope::to_peer(
            kinds::ICE_CANDIDATE,
            "a",
            "b",
            serde_json::to_value(candidate(3)).unwrap(),
        ))
        .await
        .unwrap();
    let transport = b.transport.clone();
    wait_for(
        || transport.applied_candidates().len() == 4,
        "direct candidate applied",
    )
    .await;

    // The flush-once invariant was actually exercised above.
    crabconnect::invariant_ppt::contract_test(
        "candidate flush",
        &["ICE queue is empty after flush"],
    );
}

#[tokio::test]
async fn test_media_acquisition_failure_is_fatal() {
    let hub = SignalingHub::new();
    let a = build_peer(&hub, "a", "b", "ta");
    a.media.set_fail_acquire(true);

    let result = a.engine.initialize().await;
    assert!(matches!(result, Err(crabconnect::CallError::Media(_))));
}

#[tokio::test]
async fn test_reconnect_recreates_transport_then_exhausts() {
    let hub = SignalingHub::new();
    let t1 = MockPeerTransport::new("t1");
    let t2 = MockPeerTransport::new("t2");
    let t3 = MockPeerTransport::new("t3");
    let factory = MockTransportFactory::new();
    for t in [&t1, &t2, &t3] {
        factory.push_scripted(t.clone());
    }
    let factory_handle = Arc::clone(&factory);
    let media = MockMediaSource::new();

    let (engine, mut events) = NegotiationEngine::new(
        "session-1",
        PeerIdentity::new("a", "A"),
        "b",
        hub.transport("a"),
        factory,
        media as Arc<dyn crabconnect::media::MediaSource>,
        RtcConfig::default(),
        test_negotiation_config(),
        test_stats_config(),
        false,
    );
    engine.initialize().await.unwrap();
    assert_eq!(factory_handle.created().len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First drop: one reconnect, fresh transport.
    t1.force_state(TransportState::Disconnected);
    let f = Arc::clone(&factory_handle);
    wait_for(|| f.created().len() == 2, "second transport").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second drop: last allowed attempt.
    t2.force_state(TransportState::Disconnected);
    let f = Arc::clone(&factory_handle);
    wait_for(|| f.created().len() == 3, "third transport").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Third drop exhausts the retry budget.
    t3.force_state(TransportState::Failed);

    let mut attempts_seen = Vec::new();
    let error = loop {
        match tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            EngineEvent::Reconnecting { attempt } => attempts_seen.push(attempt),
            EngineEvent::Error(message) => break message,
            _ => continue,
        }
    };
    assert_eq!(attempts_seen, vec![1, 2]);
    assert!(error.contains("exhausted"));
    assert_eq!(engine.state().await, ConnectionState::Failed);
    assert_eq!(factory_handle.created().len(), 3);
}
