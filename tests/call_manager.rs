//! Full call orchestration against in-memory collaborators: provider
//! selection, the single fallback edge, control-surface no-ops, recovery
//! convergence, and idempotent teardown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crabconnect::config::CallConfig;
use crabconnect::coordination::RecoveryPlan;
use crabconnect::errors::CallError;
use crabconnect::manager::{CallPhase, ManagerDeps, VideoCallManager};
use crabconnect::quality::conditions::NullProbe;
use crabconnect::signaling::{kinds, SignalEnvelope, SignalingTransport};
use crabconnect::stats::{SessionQualitySummary, SummarySink};
use crabconnect::testing::{
    InMemoryCoordination, MockHostedClient, MockMediaSource, MockTransportFactory, SignalingHub,
};
use crabconnect::types::{DeviceInfo, PeerIdentity, VideoProvider};

struct CountingSink {
    persisted: AtomicU32,
}

#[async_trait]
impl SummarySink for CountingSink {
    async fn persist(&self, _summary: &SessionQualitySummary) -> Result<(), CallError> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    hub: Arc<SignalingHub>,
    backend: Arc<InMemoryCoordination>,
    media: Arc<MockMediaSource>,
    hosted: Arc<MockHostedClient>,
    sink: Arc<CountingSink>,
}

fn test_config() -> CallConfig {
    let mut config = CallConfig::default();
    config.negotiation.offer_wait_ms = 50;
    config.negotiation.desktop_reconnect_step_ms = 10;
    config.health.heartbeat_interval_ms = 20;
    config.health.poll_interval_ms = 25;
    config.quality.reassess_interval_ms = 50;
    config.stats.sample_interval_ms = 25;
    config
}

fn build_manager(
    peer: &str,
    remote: &str,
) -> (
    Arc<VideoCallManager>,
    tokio::sync::mpsc::UnboundedReceiver<crabconnect::EngineEvent>,
    Fixture,
) {
    let hub = SignalingHub::new();
    let backend = InMemoryCoordination::new();
    let media = MockMediaSource::new();
    let hosted = MockHostedClient::new();
    let sink = Arc::new(CountingSink {
        persisted: AtomicU32::new(0),
    });

    let deps = ManagerDeps {
        signaling: hub.transport(peer),
        backend: Arc::clone(&backend) as Arc<dyn crabconnect::coordination::CoordinationBackend>,
        transport_factory: MockTransportFactory::new(),
        media_source: Arc::clone(&media) as Arc<dyn crabconnect::media::MediaSource>,
        probe: Arc::new(NullProbe),
        hosted_client: Arc::clone(&hosted) as Arc<dyn crabconnect::manager::HostedCallClient>,
        summary_sink: Arc::clone(&sink) as Arc<dyn SummarySink>,
    };

    let (manager, events) = VideoCallManager::new(
        "session-1",
        PeerIdentity::new(peer, "Test Peer"),
        remote,
        DeviceInfo {
            platform: "linux".to_string(),
            is_mobile: false,
        },
        test_config(),
        deps,
    );

    (
        manager,
        events,
        Fixture {
            hub,
            backend,
            media,
            hosted,
            sink,
        },
    )
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

#[tokio::test]
async fn test_start_call_selects_p2p_and_starts_liveness() {
    let (manager, _events, fixture) = build_manager("a", "b");

    let provider = manager.start_call().await.unwrap();
    assert_eq!(provider, VideoProvider::P2p);
    assert_eq!(manager.phase().await, CallPhase::InCall);
    assert_eq!(manager.active_provider().await, Some(VideoProvider::P2p));
    assert_eq!(
        fixture.backend.selected_provider("session-1"),
        Some(VideoProvider::P2p)
    );

    let session = manager.session_info().await;
    assert_eq!(session.room_id.as_deref(), Some("session-1-room"));
    let selection = session.selection.unwrap();
    assert_eq!(selection.selected_by, "a");
    assert!(selection.recovered_from.is_none());

    // The heartbeat loop reaches the backend on its own.
    let backend = Arc::clone(&fixture.backend);
    wait_for(
        || backend.heartbeat_count("session-1") == 1,
        "first heartbeat",
    )
    .await;

    manager.end_call().await.unwrap();
}

#[tokio::test]
async fn test_failed_p2p_falls_back_to_hosted_once() {
    let (manager, _events, fixture) = build_manager("a", "b");
    fixture.media.set_fail_acquire(true);

    let provider = manager.start_call().await.unwrap();
    assert_eq!(provider, VideoProvider::Daily);
    assert_eq!(manager.active_provider().await, Some(VideoProvider::Daily));
    assert!(manager.startup_fallback_used());
    assert!(fixture.hosted.is_in_room());
    assert_eq!(fixture.hosted.joined_rooms(), vec!["session-1-room"]);

    // The failure landed on the P2P reliability record.
    let record = manager
        .coordinator()
        .quality_record(VideoProvider::P2p)
        .await
        .unwrap();
    assert_eq!(record.failure_count, 1);

    manager.end_call().await.unwrap();
}

#[tokio::test]
async fn test_both_providers_failing_ends_the_call() {
    let (manager, _events, fixture) = build_manager("a", "b");
    fixture.media.set_fail_acquire(true);
    fixture.hosted.set_fail_join(true);

    let result = manager.start_call().await;
    assert!(result.is_err());
    assert_eq!(manager.phase().await, CallPhase::Ended);
}

#[tokio::test]
async fn test_backend_outage_still_starts_the_call() {
    let (manager, _events, fixture) = build_manager("a", "b");
    fixture.backend.set_fail_rpc(true);

    // Selection proceeds with the local proposal; liveness pushes just log.
    let provider = manager.start_call().await.unwrap();
    assert_eq!(provider, VideoProvider::P2p);
    assert_eq!(manager.phase().await, CallPhase::InCall);
}

#[tokio::test]
async fn test_control_surface_is_noop_without_engine() {
    let (manager, _events, _fixture) = build_manager("a", "b");

    assert!(!manager.toggle_audio().await.unwrap());
    assert!(!manager.toggle_video().await.unwrap());
    assert!(manager.send_message("dropped").await.unwrap().is_none());
    assert!(manager.connection_stats().await.is_none());
}

#[tokio::test]
async fn test_end_call_is_idempotent_and_persists_once() {
    let (manager, _events, fixture) = build_manager("a", "b");
    manager.start_call().await.unwrap();

    let first = manager.end_call().await.unwrap();
    assert!(first.is_some());
    let second = manager.end_call().await.unwrap();
    assert!(second.is_none());
    assert_eq!(fixture.sink.persisted.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase().await, CallPhase::Ended);
}

#[tokio::test]
async fn test_apply_recovery_switches_to_hosted() {
    let (manager, _events, fixture) = build_manager("a", "b");
    manager.start_call().await.unwrap();
    assert_eq!(manager.active_provider().await, Some(VideoProvider::P2p));

    manager
        .apply_recovery(RecoveryPlan {
            failed_provider: VideoProvider::P2p,
            new_provider: VideoProvider::Daily,
            room_id: "session-1-daily".to_string(),
            affected_peers: vec!["a".to_string(), "b".to_string()],
            authoritative: true,
            reason: "p2p failed mid-call".to_string(),
        })
        .await;

    assert_eq!(manager.active_provider().await, Some(VideoProvider::Daily));
    assert!(fixture.hosted.is_in_room());
    assert_eq!(fixture.hosted.joined_rooms(), vec!["session-1-daily"]);

    // The session record remembers what was recovered from.
    let session = manager.session_info().await;
    assert_eq!(
        session.selection.unwrap().recovered_from,
        Some(VideoProvider::P2p)
    );

    manager.end_call().await.unwrap();
}

#[tokio::test]
async fn test_recovery_broadcast_from_peer_converges() {
    let (manager, _events, fixture) = build_manager("a", "b");
    manager.start_call().await.unwrap();

    // The other peer observed the failure and broadcast the plan.
    let plan = RecoveryPlan {
        failed_provider: VideoProvider::P2p,
        new_provider: VideoProvider::Daily,
        room_id: "session-1-daily".to_string(),
        affected_peers: vec!["a".to_string(), "b".to_string()],
        authoritative: true,
        reason: "p2p failed mid-call".to_string(),
    };
    let remote = fixture.hub.transport("b");
    remote
        .send(SignalEnvelope::broadcast(
            kinds::COORDINATED_RECOVERY,
            "b",
            serde_json::to_value(&plan).unwrap(),
        ))
        .await
        .unwrap();

    let manager_handle = Arc::clone(&manager);
    for _ in 0..300 {
        if manager_handle.active_provider().await == Some(VideoProvider::Daily) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.active_provider().await, Some(VideoProvider::Daily));
    assert!(fixture.hosted.is_in_room());

    manager.end_call().await.unwrap();
}
