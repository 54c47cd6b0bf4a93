//! Heartbeat liveness and aggregate health monitoring with injected
//! staleness, so no test depends on real clocks.

use std::sync::Arc;

use crabconnect::config::HealthConfig;
use crabconnect::coordination::{CoordinationBackend, PeerStateUpdate};
use crabconnect::session::{
    HealthAlertKind, HealthEvent, HealthMonitor, SessionStateManager,
};
use crabconnect::testing::{stats_sample, InMemoryCoordination};
use crabconnect::types::{ConnectionState, DeviceInfo, PeerIdentity, VideoProvider};

fn health_config() -> HealthConfig {
    HealthConfig {
        heartbeat_interval_ms: 10,
        poll_interval_ms: 20,
        staleness_threshold_ms: 45_000,
        poor_latency_threshold_ms: 400.0,
        poor_loss_threshold_pct: 8.0,
    }
}

async fn push_peer(
    backend: &Arc<InMemoryCoordination>,
    peer: &str,
    state: ConnectionState,
) {
    backend
        .update_peer_state(PeerStateUpdate {
            session_id: "session-1".to_string(),
            peer_id: peer.to_string(),
            peer_name: peer.to_uppercase(),
            connection_state: state,
            current_provider: Some(VideoProvider::P2p),
            device_info: DeviceInfo {
                platform: "linux".to_string(),
                is_mobile: false,
            },
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_heartbeat_loop_reaches_backend() {
    let backend = InMemoryCoordination::new();
    let manager = SessionStateManager::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        PeerIdentity::new("a", "A"),
        DeviceInfo {
            platform: "linux".to_string(),
            is_mobile: false,
        },
    );

    manager.start_heartbeat(10).await;
    for _ in 0..300 {
        if backend.heartbeat_count("session-1") == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(backend.heartbeat_count("session-1"), 1);
    manager.stop().await;
}

#[tokio::test]
async fn test_state_pushes_are_visible_in_backend() {
    let backend = InMemoryCoordination::new();
    let manager = SessionStateManager::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        PeerIdentity::new("a", "A"),
        DeviceInfo {
            platform: "linux".to_string(),
            is_mobile: false,
        },
    );

    manager.push_state(ConnectionState::Connecting).await;
    assert_eq!(
        backend.peer_state("session-1", "a"),
        Some(ConnectionState::Connecting)
    );

    manager.push_provider(VideoProvider::Daily).await;
    manager.push_state(ConnectionState::Connected).await;
    assert_eq!(
        backend.peer_state("session-1", "a"),
        Some(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn test_stale_peer_raises_alert() {
    let backend = InMemoryCoordination::new();
    push_peer(&backend, "a", ConnectionState::Connected).await;
    push_peer(&backend, "b", ConnectionState::Connected).await;
    backend.set_ping_age("session-1", "a", Some(0));
    backend.set_ping_age("session-1", "b", Some(60_000));

    let monitor = HealthMonitor::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        health_config(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.poll_once(&tx).await;

    let mut saw_overview = false;
    let mut stale_alert = None;
    let mut recommendation = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            HealthEvent::Overview(overview) => {
                saw_overview = true;
                assert_eq!(overview.connected, 2);
            }
            HealthEvent::Alert(alert) if alert.kind == HealthAlertKind::StaleConnections => {
                stale_alert = Some(alert);
            }
            HealthEvent::Alert(_) => {}
            HealthEvent::Recommendation(rec) => recommendation = Some(rec),
        }
    }

    assert!(saw_overview);
    let alert = stale_alert.unwrap();
    assert_eq!(alert.count, 1);
    let rec = recommendation.unwrap();
    assert!(rec.recommended);
    assert_eq!(rec.stale_peers, 1);
}

#[tokio::test]
async fn test_degraded_averages_raise_poor_quality_alert() {
    let backend = InMemoryCoordination::new();
    push_peer(&backend, "a", ConnectionState::Connected).await;
    push_peer(&backend, "b", ConnectionState::Connected).await;
    backend.set_ping_age("session-1", "a", Some(0));
    backend.set_ping_age("session-1", "b", Some(0));
    backend.set_peer_stats(
        "session-1",
        "a",
        stats_sample(650.0, 12.0, 200.0, "320x240", 10.0),
    );
    backend.set_peer_stats(
        "session-1",
        "b",
        stats_sample(500.0, 9.0, 250.0, "320x240", 12.0),
    );

    let monitor = HealthMonitor::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        health_config(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.poll_once(&tx).await;

    let mut poor_alert = false;
    let mut recommended = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            HealthEvent::Alert(alert) if alert.kind == HealthAlertKind::PoorQuality => {
                poor_alert = true;
            }
            HealthEvent::Recommendation(rec) => recommended = rec.recommended,
            _ => {}
        }
    }
    assert!(poor_alert);
    assert!(recommended);
}

#[tokio::test]
async fn test_healthy_session_emits_overview_only() {
    let backend = InMemoryCoordination::new();
    push_peer(&backend, "a", ConnectionState::Connected).await;
    push_peer(&backend, "b", ConnectionState::Connected).await;
    backend.set_ping_age("session-1", "a", Some(100));
    backend.set_ping_age("session-1", "b", Some(200));
    backend.set_peer_stats(
        "session-1",
        "a",
        stats_sample(40.0, 0.2, 2500.0, "1280x720", 30.0),
    );
    backend.set_peer_stats(
        "session-1",
        "b",
        stats_sample(55.0, 0.4, 2300.0, "1280x720", 30.0),
    );

    let monitor = HealthMonitor::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        health_config(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.poll_once(&tx).await;

    let mut overview_count = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            HealthEvent::Overview(_) => overview_count += 1,
            HealthEvent::Alert(alert) => panic!("unexpected alert: {:?}", alert.kind),
            HealthEvent::Recommendation(rec) => {
                panic!("unexpected recommendation: {}", rec.reason)
            }
        }
    }
    assert_eq!(overview_count, 1);
}

#[tokio::test]
async fn test_alert_read_models_are_served_by_the_backend() {
    let backend = InMemoryCoordination::new();
    push_peer(&backend, "a", ConnectionState::Connected).await;
    push_peer(&backend, "b", ConnectionState::Failed).await;
    backend.set_ping_age("session-1", "a", Some(60_000));
    backend.set_ping_age("session-1", "b", Some(0));

    let alerts = backend.active_alerts("session-1").await.unwrap();
    assert!(alerts
        .iter()
        .any(|a| a.kind == HealthAlertKind::StaleConnections && a.count == 1));
    assert!(alerts
        .iter()
        .any(|a| a.kind == HealthAlertKind::FailedConnections && a.count == 1));

    let rec = backend.recovery_recommendation("session-1").await.unwrap();
    assert!(rec.recommended);
    assert_eq!(rec.stale_peers, 1);
    assert_eq!(rec.failed_peers, 1);
    assert_eq!(rec.reason, "failed peer connections present");

    // The monitor forwards exactly what the backend computed.
    let monitor = HealthMonitor::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        health_config(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.poll_once(&tx).await;

    let mut alert_kinds = Vec::new();
    let mut recommended = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            HealthEvent::Alert(alert) => alert_kinds.push(alert.kind),
            HealthEvent::Recommendation(rec) => recommended = rec.recommended,
            HealthEvent::Overview(_) => {}
        }
    }
    assert!(alert_kinds.contains(&HealthAlertKind::StaleConnections));
    assert!(alert_kinds.contains(&HealthAlertKind::FailedConnections));
    assert!(recommended);
}

#[tokio::test]
async fn test_failed_peer_raises_failed_alert() {
    let backend = InMemoryCoordination::new();
    push_peer(&backend, "a", ConnectionState::Connected).await;
    push_peer(&backend, "b", ConnectionState::Failed).await;
    backend.set_ping_age("session-1", "a", Some(0));
    backend.set_ping_age("session-1", "b", Some(0));

    let monitor = HealthMonitor::new(
        Arc::clone(&backend) as Arc<dyn CoordinationBackend>,
        "session-1",
        health_config(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.poll_once(&tx).await;

    let mut failed_alert = None;
    while let Ok(event) = rx.try_recv() {
        if let HealthEvent::Alert(alert) = event {
            if alert.kind == HealthAlertKind::FailedConnections {
                failed_alert = Some(alert);
            }
        }
    }
    assert_eq!(failed_alert.unwrap().count, 1);
}
