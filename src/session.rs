//! Session liveness and health tracking.
//!
//! [`SessionStateManager`] pushes heartbeats on a fixed interval and state
//! transitions on occurrence. [`HealthMonitor`] independently polls the
//! aggregate health view, flags stale peers, and emits alerts and recovery
//! recommendations. Both ride the same backend contract as provider
//! coordination but operate on independent data.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::coordination::{CoordinationBackend, HealthOverview, PeerStateUpdate};
use crate::types::{ConnectionState, DeviceInfo, PeerIdentity, VideoProvider};

pub use crate::coordination::{HealthAlert, HealthAlertKind, RecoveryRecommendation};

/// Tracks the local peer's connection state and liveness with the backend.
pub struct SessionStateManager {
    backend: Arc<dyn CoordinationBackend>,
    session_id: String,
    peer: PeerIdentity,
    device_info: DeviceInfo,
    current_state: Arc<RwLock<ConnectionState>>,
    current_provider: Arc<RwLock<Option<VideoProvider>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStateManager {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        session_id: &str,
        peer: PeerIdentity,
        device_info: DeviceInfo,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.to_string(),
            peer,
            device_info,
            current_state: Arc::new(RwLock::new(ConnectionState::Initializing)),
            current_provider: Arc::new(RwLock::new(None)),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub async fn current_state(&self) -> ConnectionState {
        *self.current_state.read().await
    }

    /// Record a state transition and push it to the backend immediately.
    /// Backend failures are logged, never propagated; liveness must not take
    /// the call down.
    pub async fn push_state(&self, state: ConnectionState) {
        *self.current_state.write().await = state;
        let provider = *self.current_provider.read().await;

        let update = PeerStateUpdate {
            session_id: self.session_id.clone(),
            peer_id: self.peer.id.clone(),
            peer_name: self.peer.display_name.clone(),
            connection_state: state,
            current_provider: provider,
            device_info: self.device_info.clone(),
        };

        if let Err(e) = self.backend.update_peer_state(update).await {
            log::warn!(
                "Failed to push state {} for peer {}: {}",
                state.as_str(),
                self.peer.id,
                e
            );
        }
    }

    /// Record the active provider and push the combined state.
    pub async fn push_provider(&self, provider: VideoProvider) {
        *self.current_provider.write().await = Some(provider);
        let state = *self.current_state.read().await;
        self.push_state(state).await;
    }

    /// Start the periodic heartbeat. Idempotent.
    pub async fn start_heartbeat(&self, interval_ms: u64) {
        let mut task = self.heartbeat_task.lock().await;
        if task.is_some() {
            return;
        }

        let backend = Arc::clone(&self.backend);
        let session_id = self.session_id.clone();
        let peer_id = self.peer.id.clone();
        let interval = std::time::Duration::from_millis(interval_ms);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = backend.heartbeat(&session_id, &peer_id).await {
                    log::warn!("Heartbeat failed for peer {}: {}", peer_id, e);
                }
            }
        }));
    }

    /// Stop the heartbeat task. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.heartbeat_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Events emitted by the monitor's polling loop.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Overview(HealthOverview),
    Alert(HealthAlert),
    Recommendation(RecoveryRecommendation),
}

/// Count peers whose last heartbeat exceeds the staleness threshold.
pub fn count_stale_peers(overview: &HealthOverview, staleness_threshold_ms: u64) -> u32 {
    overview
        .peers
        .iter()
        .filter(|p| !p.connection_state.is_terminal())
        .filter(|p| match p.ping_age_ms {
            Some(age) => age > staleness_threshold_ms as i64,
            // A peer that never heartbeat at all counts as stale.
            None => true,
        })
        .count() as u32
}

/// Pure evaluation of one overview snapshot into alerts + recommendation.
/// Backend implementations serve the `active_alerts` and
/// `recovery_recommendation` read models with this logic.
pub fn evaluate_health(
    overview: &HealthOverview,
    config: &HealthConfig,
) -> (Vec<HealthAlert>, RecoveryRecommendation) {
    let mut alerts = Vec::new();
    let stale = count_stale_peers(overview, config.staleness_threshold_ms);

    if stale > 0 {
        alerts.push(HealthAlert {
            kind: HealthAlertKind::StaleConnections,
            message: format!("{} peer(s) have missed heartbeats", stale),
            count: stale,
        });
    }

    let poor_quality = overview.avg_latency_ms > config.poor_latency_threshold_ms
        || overview.avg_packet_loss_pct > config.poor_loss_threshold_pct;
    if poor_quality && overview.connected > 0 {
        alerts.push(HealthAlert {
            kind: HealthAlertKind::PoorQuality,
            message: format!(
                "aggregate quality degraded (latency {:.0}ms, loss {:.1}%)",
                overview.avg_latency_ms, overview.avg_packet_loss_pct
            ),
            count: overview.connected,
        });
    }

    if overview.failed > 0 {
        alerts.push(HealthAlert {
            kind: HealthAlertKind::FailedConnections,
            message: format!("{} peer connection(s) failed", overview.failed),
            count: overview.failed,
        });
    }

    let recommended = stale > 0 || overview.failed > 0 || poor_quality;
    let reason = if overview.failed > 0 {
        "failed peer connections present".to_string()
    } else if stale > 0 {
        "stale peer heartbeats detected".to_string()
    } else if poor_quality {
        "aggregate quality below threshold".to_string()
    } else {
        "session healthy".to_string()
    };

    let recommendation = RecoveryRecommendation {
        recommended,
        reason,
        avg_latency_ms: overview.avg_latency_ms,
        avg_packet_loss_pct: overview.avg_packet_loss_pct,
        stale_peers: stale,
        failed_peers: overview.failed,
    };

    (alerts, recommendation)
}

/// Polls the aggregate session health view and emits [`HealthEvent`]s.
pub struct HealthMonitor {
    backend: Arc<dyn CoordinationBackend>,
    session_id: String,
    config: HealthConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        session_id: &str,
        config: HealthConfig,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.to_string(),
            config,
            task: Mutex::new(None),
        }
    }

    /// One poll cycle: fetch the overview, alert, and recommendation read
    /// models from the backend and emit them as events.
    pub async fn poll_once(&self, events: &mpsc::UnboundedSender<HealthEvent>) {
        match self.backend.health_overview(&self.session_id).await {
            Ok(overview) => {
                let _ = events.send(HealthEvent::Overview(overview));
            }
            Err(e) => {
                log::warn!(
                    "Health overview poll failed for session {}: {}",
                    self.session_id,
                    e
                );
                return;
            }
        }

        match self.backend.active_alerts(&self.session_id).await {
            Ok(alerts) => {
                for alert in alerts {
                    log::warn!(
                        "Health alert for session {}: {:?} - {}",
                        self.session_id,
                        alert.kind,
                        alert.message
                    );
                    let _ = events.send(HealthEvent::Alert(alert));
                }
            }
            Err(e) => {
                log::warn!(
                    "Alert poll failed for session {}: {}",
                    self.session_id,
                    e
                );
            }
        }

        match self.backend.recovery_recommendation(&self.session_id).await {
            Ok(recommendation) if recommendation.recommended => {
                let _ = events.send(HealthEvent::Recommendation(recommendation));
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "Recommendation poll failed for session {}: {}",
                    self.session_id,
                    e
                );
            }
        }
    }

    /// Start the polling loop. Returns the event receiver. Idempotent in the
    /// sense that a second start replaces nothing and returns a dead channel.
    pub async fn start(self: &Arc<Self>) -> mpsc::UnboundedReceiver<HealthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut task = self.task.lock().await;
        if task.is_some() {
            return rx;
        }

        let monitor = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.poll_once(&tx).await;
            }
        }));

        rx
    }

    /// Cancel the polling loop. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}
