//! Glare-resistant offer/answer/ICE negotiation engine.
//!
//! One engine owns one peer-connection instance per call attempt, the local
//! media tracks, and the data channel used for chat and mute signaling. Glare
//! (both peers offering simultaneously) is resolved with the Perfect
//! Negotiation polite/impolite protocol: roles are derived deterministically
//! from the two peer ids, so at most one offer wins per collision without any
//! cross-peer lock.
//!
//! The negotiation flags and candidate queue are a single-writer region: all
//! signaling is handled sequentially by one task per engine instance, and the
//! whole flag set is recreated on reconnect, never mutated from outside.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::{NegotiationConfig, StatsConfig};
use crate::errors::CallError;
use crate::media::{
    IceCandidate, MediaSource, MediaTrack, PeerTransport, PeerTransportFactory, RtcConfig,
    SdpKind, SessionDescription, SignalingState, TrackKind, TransportEvent, TransportState,
};
use crate::signaling::{kinds, SignalEnvelope, SignalingTransport};
use crate::types::{
    classify_sample, derive_roles, ConnectionState, ConnectionStats, NegotiationRole,
    PeerIdentity, PeerRole,
};

/// Chat message carried over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Tagged payloads exchanged over the data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ChannelPayload {
    Chat(ChatMessage),
    MediaToggle { kind: TrackKind, enabled: bool },
}

/// Uniform event stream emitted by an engine instance.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Terminal failure after retry exhaustion or fatal media error.
    Error(String),
    StatsUpdate(ConnectionStats),
    Message(ChatMessage),
    RemoteMediaToggled { kind: TrackKind, enabled: bool },
}

/// Transient per-connection-attempt negotiation state. Recreated wholesale on
/// every reconnect.
#[derive(Debug, Default)]
struct NegotiationFlags {
    making_offer: bool,
    ignore_offer: bool,
    has_remote_description: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

pub struct NegotiationEngine {
    session_id: String,
    local: PeerIdentity,
    remote_id: String,
    pub role: PeerRole,
    pub negotiation_role: NegotiationRole,
    config: NegotiationConfig,
    stats_config: StatsConfig,
    is_mobile: bool,

    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn PeerTransportFactory>,
    media_source: Arc<dyn MediaSource>,
    rtc_config: RtcConfig,

    transport: RwLock<Option<Arc<dyn PeerTransport>>>,
    tracks: RwLock<Vec<Arc<dyn MediaTrack>>>,
    state: RwLock<ConnectionState>,
    flags: Mutex<NegotiationFlags>,
    last_stats: RwLock<Option<ConnectionStats>>,

    events: mpsc::UnboundedSender<EngineEvent>,
    remote_present: AtomicBool,
    peer_joined: Notify,
    reconnect_attempts: AtomicU32,
    ended: AtomicBool,

    signal_task: Mutex<Option<JoinHandle<()>>>,
    transport_task: Mutex<Option<JoinHandle<()>>>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    offer_task: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationEngine {
    /// Build an engine and the receiver for its event stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: &str,
        local: PeerIdentity,
        remote_id: &str,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerTransportFactory>,
        media_source: Arc<dyn MediaSource>,
        rtc_config: RtcConfig,
        config: NegotiationConfig,
        stats_config: StatsConfig,
        is_mobile: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (role, negotiation_role) = derive_roles(&local.id, remote_id);

        let engine = Arc::new(Self {
            session_id: session_id.to_string(),
            local,
            remote_id: remote_id.to_string(),
            role,
            negotiation_role,
            config,
            stats_config,
            is_mobile,
            signaling,
            factory,
            media_source,
            rtc_config,
            transport: RwLock::new(None),
            tracks: RwLock::new(Vec::new()),
            state: RwLock::new(ConnectionState::Initializing),
            flags: Mutex::new(NegotiationFlags::default()),
            last_stats: RwLock::new(None),
            events,
            remote_present: AtomicBool::new(false),
            peer_joined: Notify::new(),
            reconnect_attempts: AtomicU32::new(0),
            ended: AtomicBool::new(false),
            signal_task: Mutex::new(None),
            transport_task: Mutex::new(None),
            stats_task: Mutex::new(None),
            offer_task: Mutex::new(None),
        });

        (engine, rx)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn last_stats(&self) -> Option<ConnectionStats> {
        self.last_stats.read().await.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Acquire media, open signaling, create the peer connection, and (for
    /// the initiator) send the first offer once the remote peer announces
    /// presence or the bounded wait elapses.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), CallError> {
        log::info!(
            "Initializing negotiation engine for session {} as {:?}/{:?}",
            self.session_id,
            self.role,
            self.negotiation_role
        );

        // Media acquisition failure is fatal for the attempt, never retried.
        let tracks = self.media_source.acquire().await?;
        *self.tracks.write().await = tracks;

        self.signaling
            .connect(&self.session_id, &self.local.id)
            .await?;
        let signal_rx = self.signaling.subscribe().await?;

        self.create_transport().await?;
        self.set_state(ConnectionState::Connecting).await;

        let engine = Arc::clone(self);
        *self.signal_task.lock().await = Some(tokio::spawn(async move {
            engine.signal_loop(signal_rx).await;
        }));

        // Announce presence so a waiting initiator can proceed immediately.
        self.signaling
            .send(SignalEnvelope::broadcast(
                kinds::PEER_JOINED,
                &self.local.id,
                serde_json::json!({ "displayName": self.local.display_name }),
            ))
            .await?;

        if self.role == PeerRole::Initiator {
            let engine = Arc::clone(self);
            *self.offer_task.lock().await = Some(tokio::spawn(async move {
                engine.initial_offer().await;
            }));
        }

        Ok(())
    }

    /// Wait for the remote presence signal (bounded, to tolerate a lost
    /// message) and send the first offer if none is already pending.
    async fn initial_offer(self: Arc<Self>) {
        if !self.remote_present.load(Ordering::SeqCst) {
            let wait = std::time::Duration::from_millis(self.config.offer_wait_ms);
            if tokio::time::timeout(wait, self.peer_joined.notified())
                .await
                .is_err()
            {
                log::warn!(
                    "No peer-joined signal within {}ms, sending offer anyway",
                    self.config.offer_wait_ms
                );
            }
        }

        let already_pending = {
            let flags = self.flags.lock().await;
            flags.making_offer
        };
        if !already_pending {
            if let Err(e) = self.send_offer().await {
                log::warn!("Initial offer failed: {}", e);
            }
        }
    }

    /// Create a fresh peer-connection instance and wire its event stream.
    async fn create_transport(self: &Arc<Self>) -> Result<(), CallError> {
        let transport: Arc<dyn PeerTransport> =
            Arc::from(self.factory.create(self.rtc_config.clone()).await?);
        let transport_rx = transport.subscribe();

        if self.role == PeerRole::Initiator {
            transport
                .create_data_channel(&self.config.data_channel_label)
                .await?;
        }

        *self.transport.write().await = Some(transport);

        if let Some(handle) = self.transport_task.lock().await.take() {
            handle.abort();
        }
        let engine = Arc::clone(self);
        *self.transport_task.lock().await = Some(tokio::spawn(async move {
            engine.transport_loop(transport_rx).await;
        }));

        Ok(())
    }

    async fn active_transport(&self) -> Result<Arc<dyn PeerTransport>, CallError> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| CallError::Negotiation("no active peer transport".to_string()))
    }

    async fn signal_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SignalEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            if envelope.from == self.local.id || !envelope.to.includes(&self.local.id) {
                continue;
            }
            if let Err(e) = self.handle_signal(envelope).await {
                // Negotiation errors are absorbed; reconnect handles the rest.
                log::warn!("Signal handling error in session {}: {}", self.session_id, e);
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) -> Result<(), CallError> {
        match envelope.kind.as_str() {
            kinds::PEER_JOINED => {
                let first_sighting = !self.remote_present.swap(true, Ordering::SeqCst);
                self.peer_joined.notify_waiters();
                // Answer a broadcast announcement with a directed one so a
                // peer that joined first learns about us exactly once.
                if first_sighting {
                    let ack = SignalEnvelope::to_peer(
                        kinds::PEER_JOINED,
                        &self.local.id,
                        &envelope.from,
                        serde_json::json!({ "displayName": self.local.display_name }),
                    );
                    let _ = self.signaling.send(ack).await;
                }
                Ok(())
            }
            kinds::OFFER => {
                let desc: SessionDescription = serde_json::from_value(envelope.payload)
                    .map_err(|e| CallError::Negotiation(format!("malformed offer: {}", e)))?;
                self.handle_offer(desc).await
            }
            kinds::ANSWER => {
                let desc: SessionDescription = serde_json::from_value(envelope.payload)
                    .map_err(|e| CallError::Negotiation(format!("malformed answer: {}", e)))?;
                self.handle_answer(desc).await
            }
            kinds::ICE_CANDIDATE => {
                let candidate: IceCandidate = serde_json::from_value(envelope.payload)
                    .map_err(|e| CallError::Negotiation(format!("malformed candidate: {}", e)))?;
                self.handle_candidate(candidate).await
            }
            kinds::BYE => {
                log::info!("Remote peer {} left session {}", envelope.from, self.session_id);
                let _ = self.events.send(EngineEvent::Disconnected);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Send an offer, guarded by `making_offer` so a renegotiation request
    /// cannot stack a second offer on top of an in-flight one.
    async fn send_offer(self: &Arc<Self>) -> Result<(), CallError> {
        let transport = self.active_transport().await?;
        {
            let mut flags = self.flags.lock().await;
            if flags.making_offer {
                return Ok(());
            }
            flags.making_offer = true;
        }

        let result = async {
            let offer = transport.create_offer().await?;
            self.signaling
                .send(SignalEnvelope::to_peer(
                    kinds::OFFER,
                    &self.local.id,
                    &self.remote_id,
                    serde_json::to_value(&offer)
                        .map_err(|e| CallError::Negotiation(e.to_string()))?,
                ))
                .await
        }
        .await;

        self.flags.lock().await.making_offer = false;
        result
    }

    /// Perfect Negotiation offer handling.
    async fn handle_offer(self: &Arc<Self>, offer: SessionDescription) -> Result<(), CallError> {
        if offer.kind != SdpKind::Offer {
            return Err(CallError::Negotiation("expected an offer".to_string()));
        }
        let transport = self.active_transport().await?;

        let collision = {
            let flags = self.flags.lock().await;
            transport.signaling_state() != SignalingState::Stable || flags.making_offer
        };

        if self.negotiation_role == NegotiationRole::Impolite && collision {
            // Our in-flight offer wins; drop theirs silently.
            log::debug!(
                "Impolite peer {} ignoring colliding offer in session {}",
                self.local.id,
                self.session_id
            );
            self.flags.lock().await.ignore_offer = true;
            return Ok(());
        }
        self.flags.lock().await.ignore_offer = false;

        if collision {
            // Polite peer yields: discard the pending local offer first.
            transport.rollback_local_description().await?;
        }

        self.apply_remote_description(&transport, offer).await?;

        let answer = transport.create_answer().await?;
        self.signaling
            .send(SignalEnvelope::to_peer(
                kinds::ANSWER,
                &self.local.id,
                &self.remote_id,
                serde_json::to_value(&answer).map_err(|e| CallError::Negotiation(e.to_string()))?,
            ))
            .await
    }

    async fn handle_answer(self: &Arc<Self>, answer: SessionDescription) -> Result<(), CallError> {
        if answer.kind != SdpKind::Answer {
            return Err(CallError::Negotiation("expected an answer".to_string()));
        }
        let transport = self.active_transport().await?;
        if self.flags.lock().await.ignore_offer {
            // Stale answer to an offer that lost a collision round.
            return Ok(());
        }
        self.apply_remote_description(&transport, answer).await
    }

    /// Apply a remote description, then flush queued candidates exactly once,
    /// in arrival order, on the first successful application.
    async fn apply_remote_description(
        &self,
        transport: &Arc<dyn PeerTransport>,
        desc: SessionDescription,
    ) -> Result<(), CallError> {
        transport.set_remote_description(desc).await?;

        let queued: Vec<IceCandidate> = {
            let mut flags = self.flags.lock().await;
            flags.has_remote_description = true;
            let drained: Vec<IceCandidate> = flags.pending_candidates.drain(..).collect();
            crate::assert_invariant!(
                flags.pending_candidates.is_empty(),
                "ICE queue is empty after flush",
                "negotiation"
            );
            drained
        };

        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                log::warn!("Queued ICE candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_candidate(self: &Arc<Self>, candidate: IceCandidate) -> Result<(), CallError> {
        let queue_it = {
            let mut flags = self.flags.lock().await;
            if !flags.has_remote_description {
                flags.pending_candidates.push_back(candidate.clone());
                true
            } else {
                false
            }
        };
        if queue_it {
            return Ok(());
        }

        let transport = self.active_transport().await?;
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            if self.flags.lock().await.ignore_offer {
                // Candidates for an ignored offer are expected to fail.
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn transport_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::StateChanged(state) => self.handle_transport_state(state).await,
                TransportEvent::LocalCandidate(candidate) => {
                    let envelope = SignalEnvelope::to_peer(
                        kinds::ICE_CANDIDATE,
                        &self.local.id,
                        &self.remote_id,
                        serde_json::to_value(&candidate).unwrap_or(serde_json::Value::Null),
                    );
                    if let Err(e) = self.signaling.send(envelope).await {
                        log::warn!("Failed to signal local candidate: {}", e);
                    }
                }
                TransportEvent::NegotiationNeeded => {
                    // Renegotiation follows the same guarded offer path.
                    if let Err(e) = self.send_offer().await {
                        log::warn!("Renegotiation offer failed: {}", e);
                    }
                }
                TransportEvent::DataChannelOpened(label) => {
                    log::debug!("Data channel '{}' opened by remote peer", label);
                }
                TransportEvent::DataChannelMessage { data, .. } => {
                    self.handle_channel_message(&data);
                }
            }
        }
    }

    async fn handle_transport_state(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Connected => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected).await;
                let _ = self.events.send(EngineEvent::Connected);
                self.start_stats_task().await;
            }
            TransportState::Disconnected | TransportState::Failed => {
                if self.ended.load(Ordering::SeqCst) {
                    return;
                }
                self.stop_stats_task().await;
                let _ = self.events.send(EngineEvent::Disconnected);
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.reconnect().await;
                });
            }
            _ => {}
        }
    }

    /// Bounded reconnect with linear backoff. Each attempt tears the whole
    /// peer-connection instance down and starts a fresh one with reset
    /// negotiation state.
    ///
    /// Boxed because failed attempts respawn the reconnect loop, which
    /// async fn cannot express recursively.
    fn reconnect(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.reconnect_inner())
    }

    async fn reconnect_inner(self: Arc<Self>) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_reconnect_attempts {
            log::error!(
                "Reconnect attempts exhausted for session {}",
                self.session_id
            );
            self.set_state(ConnectionState::Failed).await;
            let _ = self.events.send(EngineEvent::Error(
                "connection lost and reconnect attempts exhausted".to_string(),
            ));
            return;
        }

        self.set_state(ConnectionState::Reconnecting).await;
        let _ = self.events.send(EngineEvent::Reconnecting { attempt });

        let delay_ms = if self.is_mobile {
            self.config.mobile_reconnect_delay_ms
        } else {
            self.config.desktop_reconnect_step_ms * u64::from(attempt)
        };
        log::info!(
            "Reconnect attempt {} for session {} in {}ms",
            attempt,
            self.session_id,
            delay_ms
        );
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

        if self.ended.load(Ordering::SeqCst) {
            return;
        }

        // Teardown, then a clean instance: flags and queue are recreated,
        // never carried across attempts.
        if let Ok(transport) = self.active_transport().await {
            let _ = transport.close().await;
        }
        *self.flags.lock().await = NegotiationFlags::default();

        match self.create_transport().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connecting).await;
                if self.role == PeerRole::Initiator {
                    if let Err(e) = self.send_offer().await {
                        log::warn!("Reconnect offer failed: {}", e);
                    }
                }
            }
            Err(e) => {
                log::warn!("Transport recreation failed: {}", e);
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.reconnect().await;
                });
            }
        }
    }

    fn handle_channel_message(&self, data: &str) {
        match serde_json::from_str::<ChannelPayload>(data) {
            Ok(ChannelPayload::Chat(message)) => {
                let _ = self.events.send(EngineEvent::Message(message));
            }
            Ok(ChannelPayload::MediaToggle { kind, enabled }) => {
                let _ = self
                    .events
                    .send(EngineEvent::RemoteMediaToggled { kind, enabled });
            }
            Err(e) => {
                log::warn!("Unparseable data-channel payload: {}", e);
            }
        }
    }

    /// Send a chat message. The sender synthesizes a local echo event instead
    /// of waiting for channel confirmation.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, CallError> {
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: self.local.id.clone(),
            text: text.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let payload = serde_json::to_string(&ChannelPayload::Chat(message.clone()))
            .map_err(|e| CallError::Negotiation(e.to_string()))?;

        let transport = self.active_transport().await?;
        transport
            .send_data(&self.config.data_channel_label, &payload)
            .await?;

        let _ = self.events.send(EngineEvent::Message(message.clone()));
        Ok(message)
    }

    async fn toggle_track(&self, kind: TrackKind) -> Result<bool, CallError> {
        let track = {
            let tracks = self.tracks.read().await;
            tracks.iter().find(|t| t.kind() == kind).cloned()
        }
        .ok_or_else(|| CallError::Media(format!("no local {:?} track", kind)))?;

        let enabled = track.set_enabled(!track.is_enabled()).await?;

        // Out-of-band notice so the remote UI can react immediately.
        let payload = serde_json::to_string(&ChannelPayload::MediaToggle { kind, enabled })
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        if let Ok(transport) = self.active_transport().await {
            if let Err(e) = transport
                .send_data(&self.config.data_channel_label, &payload)
                .await
            {
                log::warn!("Mute notification failed: {}", e);
            }
        }

        Ok(enabled)
    }

    /// Toggle the local audio track. Returns true when now muted.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Audio).await.map(|enabled| !enabled)
    }

    /// Toggle the local video track. Returns true when now off.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Video).await.map(|enabled| !enabled)
    }

    /// The local video track, for the quality controller to adapt.
    pub async fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        let tracks = self.tracks.read().await;
        tracks.iter().find(|t| t.kind() == TrackKind::Video).cloned()
    }

    async fn start_stats_task(self: &Arc<Self>) {
        let mut task = self.stats_task.lock().await;
        if task.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.stats_config.sample_interval_ms);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // Sampling only runs while connected.
                if engine.state().await != ConnectionState::Connected {
                    break;
                }
                if let Err(e) = engine.sample_stats().await {
                    log::warn!("Stats sampling failed: {}", e);
                }
            }
        }));
    }

    async fn stop_stats_task(&self) {
        if let Some(handle) = self.stats_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn sample_stats(&self) -> Result<(), CallError> {
        let transport = self.active_transport().await?;
        let raw = transport.poll_stats().await?;

        let resolution = if raw.frame_width > 0 && raw.frame_height > 0 {
            format!("{}x{}", raw.frame_width, raw.frame_height)
        } else {
            String::new()
        };

        let stats = ConnectionStats {
            bandwidth_kbps: raw.inbound_bitrate_kbps,
            latency_ms: raw.rtt_ms,
            packet_loss_pct: raw.packet_loss_pct,
            quality: classify_sample(raw.rtt_ms, raw.packet_loss_pct),
            resolution,
            frame_rate: raw.frame_rate,
            timestamp: chrono::Utc::now(),
        };

        *self.last_stats.write().await = Some(stats.clone());
        let _ = self.events.send(EngineEvent::StatsUpdate(stats));
        Ok(())
    }

    /// Tear the call down: periodic tasks, data channel + peer connection,
    /// media tracks, then signaling, in that order. Idempotent.
    pub async fn end_call(&self) -> Result<(), CallError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Ending call for session {}", self.session_id);

        self.stop_stats_task().await;
        for slot in [&self.offer_task, &self.signal_task, &self.transport_task] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
            }
        }

        let _ = self
            .signaling
            .send(SignalEnvelope::broadcast(
                kinds::BYE,
                &self.local.id,
                serde_json::Value::Null,
            ))
            .await;

        if let Some(transport) = self.transport.write().await.take() {
            // Closing the transport closes its data channels with it.
            if let Err(e) = transport.close().await {
                log::warn!("Transport close failed: {}", e);
            }
        }

        for track in self.tracks.write().await.drain(..) {
            if let Err(e) = track.stop().await {
                log::warn!("Track stop failed: {}", e);
            }
        }

        if let Err(e) = self.signaling.disconnect().await {
            log::warn!("Signaling disconnect failed: {}", e);
        }

        self.set_state(ConnectionState::Ended).await;
        Ok(())
    }
}
