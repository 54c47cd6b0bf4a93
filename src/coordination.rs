//! Multi-provider coordination.
//!
//! Both peers must converge on the same transport provider even though they
//! select independently. Correctness rests on atomic RPCs against an
//! external consistency service ([`CoordinationBackend`]); the signaling
//! broadcasts the coordinator sends afterwards are latency optimizations
//! only, never the correctness mechanism.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::CallError;
use crate::signaling::{kinds, SignalEnvelope, SignalingTransport};
use crate::types::{ConnectionState, ConnectionStats, DeviceInfo, VideoProvider};

/// Atomic provider-selection request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProviderRequest {
    pub session_id: String,
    pub peer_id: String,
    pub proposed_provider: VideoProvider,
    pub proposed_room_id: String,
}

/// Authoritative selection answer. When a selection already existed the
/// existing one is returned unchanged and `is_new_selection` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProviderResponse {
    pub success: bool,
    pub provider: VideoProvider,
    pub room_id: String,
    pub selected_by: String,
    pub is_new_selection: bool,
    pub reason: String,
}

/// Atomic mid-call recovery request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub session_id: String,
    pub failed_provider: VideoProvider,
    pub initiated_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub success: bool,
    pub failed_provider: VideoProvider,
    pub new_provider: VideoProvider,
    pub room_id: String,
    /// Every connected peer, not just the initiator.
    pub affected_peers: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStateUpdate {
    pub session_id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub connection_state: ConnectionState,
    pub current_provider: Option<VideoProvider>,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub ping_time: DateTime<Utc>,
}

/// Per-peer liveness/health record held by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthRecord {
    pub peer_id: String,
    pub connection_state: ConnectionState,
    pub last_stats: Option<ConnectionStats>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Milliseconds since the last heartbeat, computed by the backend so the
    /// monitor never trusts client clocks.
    pub ping_age_ms: Option<i64>,
}

/// Aggregate health view over both peers of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthOverview {
    pub connected: u32,
    pub reconnecting: u32,
    pub failed: u32,
    pub avg_latency_ms: f64,
    pub avg_packet_loss_pct: f64,
    pub avg_bandwidth_kbps: f64,
    pub peers: Vec<PeerHealthRecord>,
}

/// Alert classes raised over the session health read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAlertKind {
    StaleConnections,
    PoorQuality,
    FailedConnections,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub kind: HealthAlertKind,
    pub message: String,
    pub count: u32,
}

/// Recovery recommendation with supporting metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecommendation {
    pub recommended: bool,
    pub reason: String,
    pub avg_latency_ms: f64,
    pub avg_packet_loss_pct: f64,
    pub stale_peers: u32,
    pub failed_peers: u32,
}

/// External consistency service contract. Provider-selection data and
/// liveness data are independent even though they share this trait.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    async fn select_session_provider(
        &self,
        request: SelectProviderRequest,
    ) -> Result<SelectProviderResponse, CallError>;

    async fn coordinate_provider_recovery(
        &self,
        request: RecoveryRequest,
    ) -> Result<RecoveryResponse, CallError>;

    async fn update_peer_state(&self, update: PeerStateUpdate) -> Result<(), CallError>;

    async fn heartbeat(
        &self,
        session_id: &str,
        peer_id: &str,
    ) -> Result<HeartbeatResponse, CallError>;

    async fn health_overview(&self, session_id: &str) -> Result<HealthOverview, CallError>;

    /// Alerts currently raised for the session.
    async fn active_alerts(&self, session_id: &str) -> Result<Vec<HealthAlert>, CallError>;

    /// Whether the backend recommends a provider recovery, with the metrics
    /// behind the call.
    async fn recovery_recommendation(
        &self,
        session_id: &str,
    ) -> Result<RecoveryRecommendation, CallError>;
}

/// Per-provider reliability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderQualityRecord {
    pub provider: VideoProvider,
    /// 0-100. +5 per success, -15 per failure, a further -20 mid-call.
    pub score: f64,
    pub failure_count: u32,
    pub last_tested: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_connect_time_ms: Option<f64>,
}

impl ProviderQualityRecord {
    pub fn new(provider: VideoProvider) -> Self {
        Self {
            provider,
            score: 70.0,
            failure_count: 0,
            last_tested: None,
            last_latency_ms: None,
            last_connect_time_ms: None,
        }
    }

    pub fn record_success(&mut self, connect_time_ms: Option<f64>) {
        self.score = (self.score + 5.0).min(100.0);
        self.last_tested = Some(Utc::now());
        self.last_connect_time_ms = connect_time_ms;
    }

    pub fn record_failure(&mut self, mid_call: bool) {
        self.score -= 15.0;
        if mid_call {
            self.score -= 20.0;
        }
        self.score = self.score.max(0.0);
        self.failure_count += 1;
        self.last_tested = Some(Utc::now());
    }
}

/// Outcome of a coordinated (or best-effort local) provider switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub failed_provider: VideoProvider,
    pub new_provider: VideoProvider,
    pub room_id: String,
    pub affected_peers: Vec<String>,
    /// False when the backend was unreachable and the deterministic local
    /// alternate rule decided instead.
    pub authoritative: bool,
    pub reason: String,
}

/// Decides which provider the pair uses and coordinates mid-call switches.
pub struct ProviderCoordinator {
    backend: std::sync::Arc<dyn CoordinationBackend>,
    signaling: std::sync::Arc<dyn SignalingTransport>,
    session_id: String,
    peer_id: String,
    records: Mutex<HashMap<VideoProvider, ProviderQualityRecord>>,
    consecutive_poor_polls: Mutex<u32>,
    /// Poor polls tolerated before a mid-call recovery is triggered.
    poor_poll_threshold: u32,
}

impl ProviderCoordinator {
    pub fn new(
        backend: std::sync::Arc<dyn CoordinationBackend>,
        signaling: std::sync::Arc<dyn SignalingTransport>,
        session_id: &str,
        peer_id: &str,
    ) -> Self {
        let mut records = HashMap::new();
        records.insert(
            VideoProvider::P2p,
            ProviderQualityRecord::new(VideoProvider::P2p),
        );
        records.insert(
            VideoProvider::Daily,
            ProviderQualityRecord::new(VideoProvider::Daily),
        );

        Self {
            backend,
            signaling,
            session_id: session_id.to_string(),
            peer_id: peer_id.to_string(),
            records: Mutex::new(records),
            consecutive_poor_polls: Mutex::new(0),
            poor_poll_threshold: 3,
        }
    }

    /// Select the session provider through the atomic backend operation.
    ///
    /// Idempotent and race-free: whichever peer's write lands first wins and
    /// every later call returns that same choice. The winner broadcasts the
    /// result so the other peer converges faster, but the broadcast carries
    /// no authority.
    pub async fn select_provider(
        &self,
        proposed: VideoProvider,
        proposed_room_id: &str,
    ) -> Result<SelectProviderResponse, CallError> {
        let response = self
            .backend
            .select_session_provider(SelectProviderRequest {
                session_id: self.session_id.clone(),
                peer_id: self.peer_id.clone(),
                proposed_provider: proposed,
                proposed_room_id: proposed_room_id.to_string(),
            })
            .await?;

        log::info!(
            "Provider selection for session {}: {} (new: {}, by {})",
            self.session_id,
            response.provider,
            response.is_new_selection,
            response.selected_by
        );

        if response.is_new_selection {
            let envelope = SignalEnvelope::broadcast(
                kinds::PROVIDER_SELECTED,
                &self.peer_id,
                serde_json::json!({
                    "provider": response.provider,
                    "roomId": response.room_id,
                    "selectedBy": response.selected_by,
                }),
            );
            if let Err(e) = self.signaling.send(envelope).await {
                // Optimization only; the backend already holds the truth.
                log::warn!("Provider-selected broadcast failed: {}", e);
            }
        }

        Ok(response)
    }

    /// Record a successful connection through the given provider.
    pub async fn record_success(&self, provider: VideoProvider, connect_time_ms: Option<f64>) {
        if let Some(record) = self.records.lock().await.get_mut(&provider) {
            record.record_success(connect_time_ms);
        }
    }

    /// Record a provider failure outside an active call.
    pub async fn record_failure(&self, provider: VideoProvider) {
        if let Some(record) = self.records.lock().await.get_mut(&provider) {
            record.record_failure(false);
        }
    }

    pub async fn quality_record(&self, provider: VideoProvider) -> Option<ProviderQualityRecord> {
        self.records.lock().await.get(&provider).cloned()
    }

    /// Provider with the best reliability score, used for initial proposals.
    pub async fn preferred_provider(&self) -> VideoProvider {
        let records = self.records.lock().await;
        let p2p = records.get(&VideoProvider::P2p).map(|r| r.score).unwrap_or(0.0);
        let daily = records
            .get(&VideoProvider::Daily)
            .map(|r| r.score)
            .unwrap_or(0.0);
        if daily > p2p {
            VideoProvider::Daily
        } else {
            VideoProvider::P2p
        }
    }

    /// Feed one poor-quality poll for the active provider. Each poll counts
    /// as a failure on the provider record; once the consecutive-poll
    /// threshold is reached a coordinated recovery is initiated.
    pub async fn note_poor_quality(
        &self,
        active: VideoProvider,
    ) -> Result<Option<RecoveryPlan>, CallError> {
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(&active) {
                record.record_failure(true);
            }
        }

        let trigger = {
            let mut polls = self.consecutive_poor_polls.lock().await;
            *polls += 1;
            if *polls >= self.poor_poll_threshold {
                *polls = 0;
                true
            } else {
                false
            }
        };

        if trigger {
            self.recover(active).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reset the degradation counter after a healthy poll.
    pub async fn note_quality_recovered(&self) {
        *self.consecutive_poor_polls.lock().await = 0;
    }

    /// Coordinate a provider switch after a mid-call failure.
    ///
    /// The urgent broadcast goes to all peers so everyone switches at once,
    /// including peers that did not initiate the recovery. If the backend is
    /// unreachable the deterministic local alternate rule decides instead;
    /// both peers applying it independently may transiently disagree, which
    /// is accepted best-effort behavior.
    pub async fn recover(&self, failed: VideoProvider) -> Result<RecoveryPlan, CallError> {
        let plan = match self
            .backend
            .coordinate_provider_recovery(RecoveryRequest {
                session_id: self.session_id.clone(),
                failed_provider: failed,
                initiated_by: self.peer_id.clone(),
            })
            .await
        {
            Ok(response) => RecoveryPlan {
                failed_provider: response.failed_provider,
                new_provider: response.new_provider,
                room_id: response.room_id,
                affected_peers: response.affected_peers,
                authoritative: true,
                reason: response.reason,
            },
            Err(e) => {
                log::warn!(
                    "Recovery coordination backend unreachable ({}), applying local alternate rule",
                    e
                );
                RecoveryPlan {
                    failed_provider: failed,
                    new_provider: failed.alternate(),
                    room_id: format!("{}-{}", self.session_id, failed.alternate()),
                    affected_peers: vec![self.peer_id.clone()],
                    authoritative: false,
                    reason: "local fallback: coordination backend unreachable".to_string(),
                }
            }
        };

        let envelope = SignalEnvelope::broadcast(
            kinds::COORDINATED_RECOVERY,
            &self.peer_id,
            serde_json::to_value(&plan).unwrap_or(serde_json::Value::Null),
        );
        if let Err(e) = self.signaling.send(envelope).await {
            log::warn!("Coordinated-recovery broadcast failed: {}", e);
        }

        log::info!(
            "Provider recovery for session {}: {} -> {} (authoritative: {})",
            self.session_id,
            plan.failed_provider,
            plan.new_provider,
            plan.authoritative
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_record_success_capped() {
        let mut record = ProviderQualityRecord::new(VideoProvider::P2p);
        for _ in 0..10 {
            record.record_success(Some(120.0));
        }
        assert_eq!(record.score, 100.0);
        assert!(record.last_tested.is_some());
    }

    #[test]
    fn test_quality_record_failure_penalties() {
        let mut record = ProviderQualityRecord::new(VideoProvider::Daily);
        record.record_failure(false);
        assert_eq!(record.score, 55.0);
        record.record_failure(true);
        assert_eq!(record.score, 20.0);
        assert_eq!(record.failure_count, 2);
        // Floor at zero.
        record.record_failure(true);
        assert_eq!(record.score, 0.0);
    }
}
