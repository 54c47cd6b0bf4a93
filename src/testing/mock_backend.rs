//! In-memory coordination backend with real atomic-selection semantics, plus
//! a scriptable hosted-provider client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{CallConfig, HealthConfig};
use crate::coordination::{
    CoordinationBackend, HealthAlert, HealthOverview, HeartbeatResponse, PeerHealthRecord,
    PeerStateUpdate, RecoveryRecommendation, RecoveryRequest, RecoveryResponse,
    SelectProviderRequest, SelectProviderResponse,
};
use crate::errors::CallError;
use crate::manager::HostedCallClient;
use crate::session::evaluate_health;
use crate::types::{ConnectionState, ConnectionStats, VideoProvider};

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
struct Selection {
    provider: VideoProvider,
    room_id: String,
    selected_by: String,
}

#[derive(Clone, Default)]
struct PeerEntry {
    peer_name: String,
    connection_state: Option<ConnectionState>,
    current_provider: Option<VideoProvider>,
    last_stats: Option<ConnectionStats>,
    last_heartbeat: Option<DateTime<Utc>>,
    /// Injected instead of computed, so staleness tests need no clock.
    ping_age_ms: Option<i64>,
}

/// First-write-wins selection, per-peer liveness records, health read
/// models, and injectable failure for every RPC.
pub struct InMemoryCoordination {
    selections: Mutex<HashMap<String, Selection>>,
    peers: Mutex<HashMap<String, HashMap<String, PeerEntry>>>,
    /// Thresholds the alert/recommendation read models evaluate against.
    health_config: Mutex<HealthConfig>,
    fail_rpc: AtomicBool,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self {
            selections: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            health_config: Mutex::new(CallConfig::default().health),
            fail_rpc: AtomicBool::new(false),
        }
    }
}

impl InMemoryCoordination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every backend RPC fail until cleared.
    pub fn set_fail_rpc(&self, fail: bool) {
        self.fail_rpc.store(fail, Ordering::SeqCst);
    }

    /// Override the thresholds the health read models evaluate against.
    pub fn set_health_config(&self, config: HealthConfig) {
        *lock(&self.health_config) = config;
    }

    fn check_available(&self) -> Result<(), CallError> {
        if self.fail_rpc.load(Ordering::SeqCst) {
            return Err(CallError::Coordination(
                "injected backend failure".to_string(),
            ));
        }
        Ok(())
    }

    pub fn selected_provider(&self, session_id: &str) -> Option<VideoProvider> {
        lock(&self.selections)
            .get(session_id)
            .map(|s| s.provider)
    }

    /// Inject a heartbeat age for one peer.
    pub fn set_ping_age(&self, session_id: &str, peer_id: &str, age_ms: Option<i64>) {
        let mut peers = lock(&self.peers);
        let entry = peers
            .entry(session_id.to_string())
            .or_default()
            .entry(peer_id.to_string())
            .or_default();
        entry.ping_age_ms = age_ms;
        if age_ms.is_some() && entry.last_heartbeat.is_none() {
            entry.last_heartbeat = Some(Utc::now());
        }
    }

    /// Inject the latest stats sample for one peer.
    pub fn set_peer_stats(&self, session_id: &str, peer_id: &str, stats: ConnectionStats) {
        lock(&self.peers)
            .entry(session_id.to_string())
            .or_default()
            .entry(peer_id.to_string())
            .or_default()
            .last_stats = Some(stats);
    }

    pub fn peer_state(&self, session_id: &str, peer_id: &str) -> Option<ConnectionState> {
        lock(&self.peers)
            .get(session_id)
            .and_then(|peers| peers.get(peer_id))
            .and_then(|entry| entry.connection_state)
    }

    pub fn heartbeat_count(&self, session_id: &str) -> usize {
        lock(&self.peers)
            .get(session_id)
            .map(|peers| {
                peers
                    .values()
                    .filter(|entry| entry.last_heartbeat.is_some())
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordination {
    async fn select_session_provider(
        &self,
        request: SelectProviderRequest,
    ) -> Result<SelectProviderResponse, CallError> {
        self.check_available()?;
        let mut selections = lock(&self.selections);
        match selections.get(&request.session_id) {
            Some(existing) => Ok(SelectProviderResponse {
                success: true,
                provider: existing.provider,
                room_id: existing.room_id.clone(),
                selected_by: existing.selected_by.clone(),
                is_new_selection: false,
                reason: "existing selection returned".to_string(),
            }),
            None => {
                selections.insert(
                    request.session_id.clone(),
                    Selection {
                        provider: request.proposed_provider,
                        room_id: request.proposed_room_id.clone(),
                        selected_by: request.peer_id.clone(),
                    },
                );
                Ok(SelectProviderResponse {
                    success: true,
                    provider: request.proposed_provider,
                    room_id: request.proposed_room_id,
                    selected_by: request.peer_id,
                    is_new_selection: true,
                    reason: "proposal accepted".to_string(),
                })
            }
        }
    }

    async fn coordinate_provider_recovery(
        &self,
        request: RecoveryRequest,
    ) -> Result<RecoveryResponse, CallError> {
        self.check_available()?;
        let new_provider = request.failed_provider.alternate();
        let room_id = format!("{}-{}", request.session_id, new_provider);

        lock(&self.selections).insert(
            request.session_id.clone(),
            Selection {
                provider: new_provider,
                room_id: room_id.clone(),
                selected_by: request.initiated_by.clone(),
            },
        );

        let affected_peers: Vec<String> = lock(&self.peers)
            .get(&request.session_id)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default();

        Ok(RecoveryResponse {
            success: true,
            failed_provider: request.failed_provider,
            new_provider,
            room_id,
            affected_peers,
            reason: format!("{} failed mid-call", request.failed_provider),
        })
    }

    async fn update_peer_state(&self, update: PeerStateUpdate) -> Result<(), CallError> {
        self.check_available()?;
        let mut peers = lock(&self.peers);
        let entry = peers
            .entry(update.session_id.clone())
            .or_default()
            .entry(update.peer_id.clone())
            .or_default();
        entry.peer_name = update.peer_name;
        entry.connection_state = Some(update.connection_state);
        entry.current_provider = update.current_provider;
        Ok(())
    }

    async fn heartbeat(
        &self,
        session_id: &str,
        peer_id: &str,
    ) -> Result<HeartbeatResponse, CallError> {
        self.check_available()?;
        let now = Utc::now();
        let mut peers = lock(&self.peers);
        let entry = peers
            .entry(session_id.to_string())
            .or_default()
            .entry(peer_id.to_string())
            .or_default();
        entry.last_heartbeat = Some(now);
        entry.ping_age_ms = Some(0);
        Ok(HeartbeatResponse {
            success: true,
            ping_time: now,
        })
    }

    async fn health_overview(&self, session_id: &str) -> Result<HealthOverview, CallError> {
        self.check_available()?;
        let peers = lock(&self.peers);
        let Some(session_peers) = peers.get(session_id) else {
            return Ok(HealthOverview::default());
        };

        let mut overview = HealthOverview::default();
        let mut latencies = Vec::new();
        let mut losses = Vec::new();
        let mut bandwidths = Vec::new();

        for (peer_id, entry) in session_peers {
            let state = entry
                .connection_state
                .unwrap_or(ConnectionState::Initializing);
            match state {
                ConnectionState::Connected => overview.connected += 1,
                ConnectionState::Reconnecting => overview.reconnecting += 1,
                ConnectionState::Failed => overview.failed += 1,
                _ => {}
            }
            if let Some(stats) = &entry.last_stats {
                latencies.push(stats.latency_ms);
                losses.push(stats.packet_loss_pct);
                bandwidths.push(stats.bandwidth_kbps);
            }
            overview.peers.push(PeerHealthRecord {
                peer_id: peer_id.clone(),
                connection_state: state,
                last_stats: entry.last_stats.clone(),
                last_heartbeat: entry.last_heartbeat,
                ping_age_ms: entry.ping_age_ms,
            });
        }

        let avg = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };
        overview.avg_latency_ms = avg(&latencies);
        overview.avg_packet_loss_pct = avg(&losses);
        overview.avg_bandwidth_kbps = avg(&bandwidths);

        Ok(overview)
    }

    async fn active_alerts(&self, session_id: &str) -> Result<Vec<HealthAlert>, CallError> {
        let overview = self.health_overview(session_id).await?;
        let config = lock(&self.health_config).clone();
        Ok(evaluate_health(&overview, &config).0)
    }

    async fn recovery_recommendation(
        &self,
        session_id: &str,
    ) -> Result<RecoveryRecommendation, CallError> {
        let overview = self.health_overview(session_id).await?;
        let config = lock(&self.health_config).clone();
        Ok(evaluate_health(&overview, &config).1)
    }
}

/// Hosted-provider client double.
pub struct MockHostedClient {
    joined_rooms: Mutex<Vec<String>>,
    in_room: AtomicBool,
    fail_join: AtomicBool,
    stats: Mutex<Option<ConnectionStats>>,
}

impl MockHostedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            joined_rooms: Mutex::new(Vec::new()),
            in_room: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            stats: Mutex::new(None),
        })
    }

    pub fn set_fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    pub fn set_stats(&self, stats: ConnectionStats) {
        *lock(&self.stats) = Some(stats);
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        lock(&self.joined_rooms).clone()
    }

    pub fn is_in_room(&self) -> bool {
        self.in_room.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostedCallClient for MockHostedClient {
    async fn join(&self, room_id: &str) -> Result<(), CallError> {
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(CallError::Provider("room join rejected".to_string()));
        }
        lock(&self.joined_rooms).push(room_id.to_string());
        self.in_room.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn leave(&self) -> Result<(), CallError> {
        self.in_room.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_audio_enabled(&self, _enabled: bool) -> Result<(), CallError> {
        Ok(())
    }

    async fn set_video_enabled(&self, _enabled: bool) -> Result<(), CallError> {
        Ok(())
    }

    async fn poll_stats(&self) -> Result<Option<ConnectionStats>, CallError> {
        Ok(lock(&self.stats).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(peer: &str, provider: VideoProvider) -> SelectProviderRequest {
        SelectProviderRequest {
            session_id: "s1".to_string(),
            peer_id: peer.to_string(),
            proposed_provider: provider,
            proposed_room_id: "s1-room".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let backend = InMemoryCoordination::new();
        let first = backend
            .select_session_provider(request("a", VideoProvider::P2p))
            .await
            .unwrap();
        assert!(first.is_new_selection);

        let second = backend
            .select_session_provider(request("b", VideoProvider::Daily))
            .await
            .unwrap();
        assert!(!second.is_new_selection);
        assert_eq!(second.provider, VideoProvider::P2p);
        assert_eq!(second.selected_by, "a");
    }

    #[tokio::test]
    async fn test_recovery_switches_selection_and_lists_peers() {
        let backend = InMemoryCoordination::new();
        backend
            .select_session_provider(request("a", VideoProvider::P2p))
            .await
            .unwrap();
        backend.heartbeat("s1", "a").await.unwrap();
        backend.heartbeat("s1", "b").await.unwrap();

        let response = backend
            .coordinate_provider_recovery(RecoveryRequest {
                session_id: "s1".to_string(),
                failed_provider: VideoProvider::P2p,
                initiated_by: "a".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(response.new_provider, VideoProvider::Daily);
        assert_eq!(response.affected_peers.len(), 2);
        assert_eq!(
            backend.selected_provider("s1"),
            Some(VideoProvider::Daily)
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = InMemoryCoordination::new();
        backend.set_fail_rpc(true);
        assert!(backend.heartbeat("s1", "a").await.is_err());
        backend.set_fail_rpc(false);
        assert!(backend.heartbeat("s1", "a").await.is_ok());
    }
}
