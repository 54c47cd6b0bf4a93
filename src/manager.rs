//! Top-level call orchestration.
//!
//! [`VideoCallManager`] drives one call end to end: coordinated provider
//! selection, engine startup with a single fallback edge to the alternate
//! provider, liveness (heartbeat + health monitor), adaptive quality, stats
//! aggregation, and idempotent teardown. Every collaborator is injected, so
//! the whole flow runs against in-memory fakes in tests.
//!
//! Provider engines hide behind the [`MediaEngine`] trait. An engine that
//! cannot perform an operation returns [`CallError::NotSupported`] instead of
//! being probed for capabilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::coordination::{CoordinationBackend, ProviderCoordinator, RecoveryPlan};
use crate::errors::CallError;
use crate::media::{MediaSource, PeerTransportFactory, RtcConfig};
use crate::negotiation::{ChatMessage, EngineEvent, NegotiationEngine};
use crate::quality::conditions::NetworkProbe;
use crate::quality::controller::QualityController;
use crate::session::{HealthEvent, HealthMonitor, SessionStateManager};
use crate::signaling::{kinds, SignalingTransport};
use crate::stats::{SessionQualitySummary, StatsLogger, SummarySink};
use crate::types::{
    ConnectionState, ConnectionStats, DeviceInfo, PeerIdentity, SelectionRecord, SessionInfo,
    VideoProvider,
};

/// Uniform surface over the active provider engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn initialize(self: Arc<Self>) -> Result<(), CallError>;

    /// Toggle the microphone. Returns true when now muted.
    async fn toggle_audio(&self) -> Result<bool, CallError>;

    /// Toggle the camera. Returns true when now off.
    async fn toggle_video(&self) -> Result<bool, CallError>;

    async fn send_message(&self, text: &str) -> Result<ChatMessage, CallError>;

    async fn connection_stats(&self) -> Option<ConnectionStats>;

    async fn connection_state(&self) -> ConnectionState;

    async fn end(&self) -> Result<(), CallError>;
}

#[async_trait]
impl MediaEngine for NegotiationEngine {
    async fn initialize(self: Arc<Self>) -> Result<(), CallError> {
        NegotiationEngine::initialize(&self).await
    }

    async fn toggle_audio(&self) -> Result<bool, CallError> {
        NegotiationEngine::toggle_audio(self).await
    }

    async fn toggle_video(&self) -> Result<bool, CallError> {
        NegotiationEngine::toggle_video(self).await
    }

    async fn send_message(&self, text: &str) -> Result<ChatMessage, CallError> {
        NegotiationEngine::send_message(self, text).await
    }

    async fn connection_stats(&self) -> Option<ConnectionStats> {
        self.last_stats().await
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state().await
    }

    async fn end(&self) -> Result<(), CallError> {
        self.end_call().await
    }
}

/// Client for a hosted (SFU-backed) room provider.
#[async_trait]
pub trait HostedCallClient: Send + Sync {
    async fn join(&self, room_id: &str) -> Result<(), CallError>;
    async fn leave(&self) -> Result<(), CallError>;
    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError>;
    async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError>;
    async fn poll_stats(&self) -> Result<Option<ConnectionStats>, CallError>;
}

/// Engine adapter for the hosted provider. Media flows through the hosted
/// room, so negotiation, data-channel chat, and local track management do not
/// apply here.
pub struct HostedEngine {
    client: Arc<dyn HostedCallClient>,
    room_id: String,
    state: RwLock<ConnectionState>,
    audio_muted: AtomicBool,
    video_off: AtomicBool,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl HostedEngine {
    pub fn new(
        client: Arc<dyn HostedCallClient>,
        room_id: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            client,
            room_id: room_id.to_string(),
            state: RwLock::new(ConnectionState::Initializing),
            audio_muted: AtomicBool::new(false),
            video_off: AtomicBool::new(false),
            events,
        });
        (engine, rx)
    }
}

#[async_trait]
impl MediaEngine for HostedEngine {
    async fn initialize(self: Arc<Self>) -> Result<(), CallError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.client.join(&self.room_id).await?;
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.events.send(EngineEvent::Connected);
        Ok(())
    }

    async fn toggle_audio(&self) -> Result<bool, CallError> {
        let muted = !self.audio_muted.load(Ordering::SeqCst);
        self.client.set_audio_enabled(!muted).await?;
        self.audio_muted.store(muted, Ordering::SeqCst);
        Ok(muted)
    }

    async fn toggle_video(&self) -> Result<bool, CallError> {
        let off = !self.video_off.load(Ordering::SeqCst);
        self.client.set_video_enabled(!off).await?;
        self.video_off.store(off, Ordering::SeqCst);
        Ok(off)
    }

    async fn send_message(&self, _text: &str) -> Result<ChatMessage, CallError> {
        // Chat rides the peer-to-peer data channel only.
        Err(CallError::NotSupported(
            "data-channel chat on the hosted provider".to_string(),
        ))
    }

    async fn connection_stats(&self) -> Option<ConnectionStats> {
        self.client.poll_stats().await.ok().flatten()
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn end(&self) -> Result<(), CallError> {
        self.client.leave().await?;
        *self.state.write().await = ConnectionState::Ended;
        Ok(())
    }
}

/// Injected collaborators for a [`VideoCallManager`].
pub struct ManagerDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub backend: Arc<dyn CoordinationBackend>,
    pub transport_factory: Arc<dyn PeerTransportFactory>,
    pub media_source: Arc<dyn MediaSource>,
    pub probe: Arc<dyn NetworkProbe>,
    pub hosted_client: Arc<dyn HostedCallClient>,
    pub summary_sink: Arc<dyn SummarySink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    SelectingProvider,
    InitializingProvider,
    InCall,
    Ended,
}

/// Orchestrates one two-party call.
pub struct VideoCallManager {
    session_id: String,
    local: PeerIdentity,
    remote_id: String,
    device_info: DeviceInfo,
    config: CallConfig,
    rtc_config: RtcConfig,

    deps: ManagerDeps,
    coordinator: Arc<ProviderCoordinator>,
    session_state: Arc<SessionStateManager>,
    health: Arc<HealthMonitor>,
    quality: Arc<QualityController>,
    stats_log: Mutex<StatsLogger>,

    engine: RwLock<Option<Arc<dyn MediaEngine>>>,
    session: RwLock<SessionInfo>,
    phase: RwLock<CallPhase>,
    /// A mid-call fallback to the alternate provider is taken at most once.
    fallback_used: AtomicBool,
    ended: AtomicBool,

    call_events: mpsc::UnboundedSender<EngineEvent>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    recovery_signal_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl VideoCallManager {
    pub fn new(
        session_id: &str,
        local: PeerIdentity,
        remote_id: &str,
        device_info: DeviceInfo,
        config: CallConfig,
        deps: ManagerDeps,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let coordinator = Arc::new(ProviderCoordinator::new(
            Arc::clone(&deps.backend),
            Arc::clone(&deps.signaling),
            session_id,
            &local.id,
        ));
        let session_state = Arc::new(SessionStateManager::new(
            Arc::clone(&deps.backend),
            session_id,
            local.clone(),
            device_info.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&deps.backend),
            session_id,
            config.health.clone(),
        ));
        let quality = Arc::new(QualityController::new(
            Arc::clone(&deps.probe),
            config.quality.clone(),
        ));
        let stats_log = Mutex::new(StatsLogger::new(
            session_id,
            &local.id,
            config.stats.sample_interval_ms as f64 / 1000.0,
        ));

        let (call_events, rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            session_id: session_id.to_string(),
            local,
            remote_id: remote_id.to_string(),
            device_info,
            config,
            rtc_config: RtcConfig::default(),
            deps,
            coordinator,
            session_state,
            health,
            quality,
            stats_log,
            engine: RwLock::new(None),
            session: RwLock::new(SessionInfo::new(session_id)),
            phase: RwLock::new(CallPhase::Idle),
            fallback_used: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            call_events,
            pump_task: Mutex::new(None),
            recovery_signal_task: Mutex::new(None),
            health_task: Mutex::new(None),
        });

        (manager, rx)
    }

    pub async fn phase(&self) -> CallPhase {
        *self.phase.read().await
    }

    pub async fn active_provider(&self) -> Option<VideoProvider> {
        self.session.read().await.active_provider
    }

    /// Snapshot of the session: provider, room, and how they were chosen.
    pub async fn session_info(&self) -> SessionInfo {
        self.session.read().await.clone()
    }

    /// Whether startup had to fall back to the alternate provider.
    pub fn startup_fallback_used(&self) -> bool {
        self.fallback_used.load(Ordering::SeqCst)
    }

    pub fn coordinator(&self) -> &Arc<ProviderCoordinator> {
        &self.coordinator
    }

    async fn set_phase(&self, phase: CallPhase) {
        *self.phase.write().await = phase;
    }

    /// Run the full call startup: select a provider, bring its engine up
    /// (falling back to the alternate provider once if the first fails), then
    /// start liveness, health, and quality machinery.
    pub async fn start_call(self: &Arc<Self>) -> Result<VideoProvider, CallError> {
        self.set_phase(CallPhase::SelectingProvider).await;
        self.session_state
            .push_state(ConnectionState::Initializing)
            .await;

        let proposed = self.coordinator.preferred_provider().await;
        let proposed_room = format!("{}-room", self.session_id);

        let (provider, room_id, selection) = match self
            .coordinator
            .select_provider(proposed, &proposed_room)
            .await
        {
            Ok(response) => {
                let record = SelectionRecord {
                    selected_by: response.selected_by.clone(),
                    selected_at: chrono::Utc::now(),
                    recovered_from: None,
                    reason: response.reason.clone(),
                };
                (response.provider, response.room_id, Some(record))
            }
            Err(e) => {
                // Selection cannot block the call; proceed with the local
                // proposal and let the broadcast/backend reconcile later.
                log::warn!("Provider selection backend unreachable ({}), using {}", e, proposed);
                (proposed, proposed_room, None)
            }
        };

        self.set_phase(CallPhase::InitializingProvider).await;
        let started = match self.start_engine(provider, &room_id).await {
            Ok(()) => provider,
            Err(e) => {
                log::warn!("Provider {} failed to start: {}", provider, e);
                self.coordinator.record_failure(provider).await;

                let alternate = provider.alternate();
                self.fallback_used.store(true, Ordering::SeqCst);
                log::info!("Falling back to alternate provider {}", alternate);
                match self.start_engine(alternate, &room_id).await {
                    Ok(()) => alternate,
                    Err(e2) => {
                        self.coordinator.record_failure(alternate).await;
                        self.session_state.push_state(ConnectionState::Failed).await;
                        self.set_phase(CallPhase::Ended).await;
                        return Err(e2);
                    }
                }
            }
        };

        {
            let mut session = self.session.write().await;
            session.active_provider = Some(started);
            session.room_id = Some(room_id);
            session.selection = selection;
        }
        self.session_state.push_provider(started).await;
        self.set_phase(CallPhase::InCall).await;

        self.session_state
            .start_heartbeat(self.config.health.heartbeat_interval_ms)
            .await;
        self.start_health_forwarding().await;
        self.quality.start().await;
        self.start_recovery_listener().await;

        Ok(started)
    }

    /// Create and initialize the engine for one provider and wire its event
    /// stream into the manager.
    async fn start_engine(
        self: &Arc<Self>,
        provider: VideoProvider,
        room_id: &str,
    ) -> Result<(), CallError> {
        let (engine, events): (Arc<dyn MediaEngine>, mpsc::UnboundedReceiver<EngineEvent>) =
            match provider {
                VideoProvider::P2p => {
                    let (engine, rx) = NegotiationEngine::new(
                        &self.session_id,
                        self.local.clone(),
                        &self.remote_id,
                        Arc::clone(&self.deps.signaling),
                        Arc::clone(&self.deps.transport_factory),
                        Arc::clone(&self.deps.media_source),
                        self.rtc_config.clone(),
                        self.config.negotiation.clone(),
                        self.config.stats.clone(),
                        self.device_info.is_mobile,
                    );
                    Arc::clone(&engine).initialize().await?;
                    // The video track only exists once media is acquired.
                    if let Some(track) = engine.video_track().await {
                        self.quality.attach_track(track).await;
                    }
                    (engine as Arc<dyn MediaEngine>, rx)
                }
                VideoProvider::Daily => {
                    let (engine, rx) =
                        HostedEngine::new(Arc::clone(&self.deps.hosted_client), room_id);
                    let dyn_engine: Arc<dyn MediaEngine> = engine;
                    Arc::clone(&dyn_engine).initialize().await?;
                    (dyn_engine, rx)
                }
            };

        *self.engine.write().await = Some(engine);
        self.start_event_pump(provider, events).await;
        Ok(())
    }

    async fn start_event_pump(
        self: &Arc<Self>,
        provider: VideoProvider,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        if let Some(handle) = self.pump_task.lock().await.take() {
            handle.abort();
        }
        let manager = Arc::clone(self);
        *self.pump_task.lock().await = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_engine_event(provider, event).await;
            }
        }));
    }

    async fn handle_engine_event(self: &Arc<Self>, provider: VideoProvider, event: EngineEvent) {
        match &event {
            EngineEvent::Connected => {
                self.session_state.push_state(ConnectionState::Connected).await;
                self.coordinator.record_success(provider, None).await;
            }
            EngineEvent::Disconnected => {
                self.session_state
                    .push_state(ConnectionState::Reconnecting)
                    .await;
                self.stats_log.lock().await.record_drop();
            }
            EngineEvent::Reconnecting { .. } => {
                self.stats_log.lock().await.record_recovery_attempt();
            }
            EngineEvent::Error(_) => {
                self.session_state.push_state(ConnectionState::Failed).await;
            }
            EngineEvent::StatsUpdate(stats) => {
                self.stats_log.lock().await.record_sample(stats.clone());
                if stats.quality == crate::types::QualityLevel::Poor {
                    match self.coordinator.note_poor_quality(provider).await {
                        Ok(Some(plan)) => {
                            let manager = Arc::clone(self);
                            tokio::spawn(async move {
                                manager.apply_recovery(plan).await;
                            });
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Quality degradation handling failed: {}", e),
                    }
                } else {
                    self.coordinator.note_quality_recovered().await;
                }
            }
            EngineEvent::Message(_) | EngineEvent::RemoteMediaToggled { .. } => {}
        }
        let _ = self.call_events.send(event);
    }

    /// Switch providers per a recovery plan, whether locally initiated or
    /// received from the other peer. No-op when already on the target.
    ///
    /// Boxed because recovery can recursively re-enter itself through the
    /// engine event pump, which async fn cannot express.
    pub fn apply_recovery<'a>(
        self: &'a Arc<Self>,
        plan: RecoveryPlan,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.apply_recovery_inner(plan))
    }

    async fn apply_recovery_inner(self: &Arc<Self>, plan: RecoveryPlan) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        if self.session.read().await.active_provider == Some(plan.new_provider) {
            return;
        }
        log::info!(
            "Applying provider recovery for session {}: {} -> {} ({})",
            self.session_id,
            plan.failed_provider,
            plan.new_provider,
            plan.reason
        );

        self.stats_log.lock().await.record_recovery_attempt();

        if let Some(engine) = self.engine.write().await.take() {
            if let Err(e) = engine.end().await {
                log::warn!("Old engine teardown failed during recovery: {}", e);
            }
        }
        self.quality.detach_track().await;

        match self.start_engine(plan.new_provider, &plan.room_id).await {
            Ok(()) => {
                {
                    let mut session = self.session.write().await;
                    session.active_provider = Some(plan.new_provider);
                    session.room_id = Some(plan.room_id.clone());
                    session.selection = Some(SelectionRecord {
                        selected_by: self.local.id.clone(),
                        selected_at: chrono::Utc::now(),
                        recovered_from: Some(plan.failed_provider),
                        reason: plan.reason.clone(),
                    });
                }
                self.session_state.push_provider(plan.new_provider).await;
            }
            Err(e) => {
                log::error!("Recovery to {} failed: {}", plan.new_provider, e);
                self.coordinator.record_failure(plan.new_provider).await;
                self.session_state.push_state(ConnectionState::Failed).await;
                let _ = self
                    .call_events
                    .send(EngineEvent::Error(format!("provider recovery failed: {}", e)));
            }
        }
    }

    /// Listen for coordinated-recovery broadcasts from the other peer so both
    /// sides converge even when only one of them observed the failure.
    async fn start_recovery_listener(self: &Arc<Self>) {
        let mut rx = match self.deps.signaling.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Recovery listener unavailable: {}", e);
                return;
            }
        };
        let manager = Arc::clone(self);
        *self.recovery_signal_task.lock().await = Some(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if envelope.from == manager.local.id
                    || !envelope.to.includes(&manager.local.id)
                    || envelope.kind != kinds::COORDINATED_RECOVERY
                {
                    continue;
                }
                match serde_json::from_value::<RecoveryPlan>(envelope.payload) {
                    Ok(plan) => manager.apply_recovery(plan).await,
                    Err(e) => log::warn!("Malformed recovery broadcast: {}", e),
                }
            }
        }));
    }

    /// Forward health events into the unified call event stream as warnings.
    async fn start_health_forwarding(self: &Arc<Self>) {
        let mut rx = self.health.start().await;
        let manager = Arc::clone(self);
        *self.health_task.lock().await = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let HealthEvent::Recommendation(rec) = &event {
                    log::warn!(
                        "Recovery recommended for session {}: {}",
                        manager.session_id,
                        rec.reason
                    );
                }
            }
        }));
    }

    async fn active_engine(&self) -> Option<Arc<dyn MediaEngine>> {
        self.engine.read().await.clone()
    }

    /// Toggle the microphone. Safe no-op (returns false) when no engine is
    /// active.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        match self.active_engine().await {
            Some(engine) => engine.toggle_audio().await,
            None => {
                log::warn!("toggle_audio called with no active engine");
                Ok(false)
            }
        }
    }

    /// Toggle the camera. Safe no-op (returns false) when no engine is active.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        match self.active_engine().await {
            Some(engine) => engine.toggle_video().await,
            None => {
                log::warn!("toggle_video called with no active engine");
                Ok(false)
            }
        }
    }

    /// Send a chat message. Safe no-op when no engine is active.
    pub async fn send_message(&self, text: &str) -> Result<Option<ChatMessage>, CallError> {
        match self.active_engine().await {
            Some(engine) => engine.send_message(text).await.map(Some),
            None => {
                log::warn!("send_message called with no active engine");
                Ok(None)
            }
        }
    }

    pub async fn connection_stats(&self) -> Option<ConnectionStats> {
        match self.active_engine().await {
            Some(engine) => engine.connection_stats().await,
            None => None,
        }
    }

    /// End the call and persist the session summary. Idempotent: the first
    /// call wins, later calls return the summary-already-written error from
    /// the stats logger only if asked to finalize again; here they are
    /// absorbed and return Ok.
    pub async fn end_call(self: &Arc<Self>) -> Result<Option<SessionQualitySummary>, CallError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        log::info!("Ending call for session {}", self.session_id);

        self.quality.stop().await;
        self.health.stop().await;
        self.session_state.stop().await;
        for slot in [&self.pump_task, &self.recovery_signal_task, &self.health_task] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
            }
        }

        if let Some(engine) = self.engine.write().await.take() {
            if let Err(e) = engine.end().await {
                log::warn!("Engine teardown failed: {}", e);
            }
        }

        self.session_state.push_state(ConnectionState::Ended).await;
        self.set_phase(CallPhase::Ended).await;

        let summary = self
            .stats_log
            .lock()
            .await
            .finalize(self.deps.summary_sink.as_ref())
            .await?;
        Ok(Some(summary))
    }
}
