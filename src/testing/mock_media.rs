//! Scripted media and transport doubles.
//!
//! [`MockPeerTransport`] implements the offer/answer signaling-state machine
//! strictly: applying an offer on top of a local offer fails, exactly like a
//! real peer connection, so glare handling has to roll back or ignore. Two
//! transports can be linked so data-channel sends surface on the other side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::CallError;
use crate::media::{
    IceCandidate, MediaSource, MediaTrack, PeerTransport, PeerTransportFactory, RtcConfig,
    SdpKind, SessionDescription, SignalingState, TrackConstraints, TrackKind, TransportEvent,
    TransportState, TransportStats,
};

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MockMediaTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    applied: Mutex<Vec<TrackConstraints>>,
    /// When set, the full constraint set is rejected and only a
    /// dimensions-only retry succeeds.
    reject_frame_rate: AtomicBool,
}

impl MockMediaTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            reject_frame_rate: AtomicBool::new(false),
        })
    }

    pub fn set_reject_frame_rate(&self, reject: bool) {
        self.reject_frame_rate.store(reject, Ordering::SeqCst);
    }

    pub fn applied_constraints(&self) -> Vec<TrackConstraints> {
        lock(&self.applied).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTrack for MockMediaTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn set_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(enabled)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn apply_constraints(&self, constraints: TrackConstraints) -> Result<(), CallError> {
        if self.reject_frame_rate.load(Ordering::SeqCst) && constraints.ideal_fps.is_some() {
            return Err(CallError::Media(
                "frame-rate constraint not supported".to_string(),
            ));
        }
        lock(&self.applied).push(constraints);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CallError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockMediaSource {
    pub audio: Arc<MockMediaTrack>,
    pub video: Arc<MockMediaTrack>,
    fail_acquire: AtomicBool,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            audio: MockMediaTrack::new(TrackKind::Audio),
            video: MockMediaTrack::new(TrackKind::Video),
            fail_acquire: AtomicBool::new(false),
        })
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self) -> Result<Vec<Arc<dyn MediaTrack>>, CallError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(CallError::Media("camera unavailable".to_string()));
        }
        Ok(vec![
            Arc::clone(&self.audio) as Arc<dyn MediaTrack>,
            Arc::clone(&self.video) as Arc<dyn MediaTrack>,
        ])
    }
}

struct TransportInner {
    label: String,
    signaling_state: Mutex<SignalingState>,
    connection_state: Mutex<TransportState>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    sdp_counter: AtomicU32,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    data_channels: Mutex<Vec<String>>,
    sent_data: Mutex<Vec<(String, String)>>,
    stats: Mutex<TransportStats>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    linked: Mutex<Option<Weak<TransportInner>>>,
    fail_offer: AtomicBool,
    fail_send_data: AtomicBool,
}

impl TransportInner {
    fn emit(&self, event: TransportEvent) {
        for tx in lock(&self.subscribers).iter() {
            let _ = tx.send(event.clone());
        }
    }

    fn maybe_connect(&self) {
        if self.has_local.load(Ordering::SeqCst) && self.has_remote.load(Ordering::SeqCst) {
            let mut state = lock(&self.connection_state);
            if *state != TransportState::Connected {
                *state = TransportState::Connected;
                drop(state);
                self.emit(TransportEvent::StateChanged(TransportState::Connected));
            }
        }
    }
}

/// Cloneable handle over shared transport state, so tests keep a handle to
/// the same instance the factory handed to the engine.
#[derive(Clone)]
pub struct MockPeerTransport {
    inner: Arc<TransportInner>,
}

impl MockPeerTransport {
    pub fn new(label: &str) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                label: label.to_string(),
                signaling_state: Mutex::new(SignalingState::Stable),
                connection_state: Mutex::new(TransportState::New),
                has_local: AtomicBool::new(false),
                has_remote: AtomicBool::new(false),
                sdp_counter: AtomicU32::new(0),
                applied_candidates: Mutex::new(Vec::new()),
                data_channels: Mutex::new(Vec::new()),
                sent_data: Mutex::new(Vec::new()),
                stats: Mutex::new(TransportStats::default()),
                subscribers: Mutex::new(Vec::new()),
                linked: Mutex::new(None),
                fail_offer: AtomicBool::new(false),
                fail_send_data: AtomicBool::new(false),
            }),
        }
    }

    /// Link two transports so data sent on one surfaces as a data-channel
    /// message event on the other.
    pub fn link(a: &MockPeerTransport, b: &MockPeerTransport) {
        *lock(&a.inner.linked) = Some(Arc::downgrade(&b.inner));
        *lock(&b.inner.linked) = Some(Arc::downgrade(&a.inner));
    }

    pub fn set_fail_offer(&self, fail: bool) {
        self.inner.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send_data(&self, fail: bool) {
        self.inner.fail_send_data.store(fail, Ordering::SeqCst);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *lock(&self.inner.stats) = stats;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner.applied_candidates).clone()
    }

    pub fn data_channels(&self) -> Vec<String> {
        lock(&self.inner.data_channels).clone()
    }

    pub fn sent_data(&self) -> Vec<(String, String)> {
        lock(&self.inner.sent_data).clone()
    }

    /// Emit a local ICE candidate as the runtime would.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.inner.emit(TransportEvent::LocalCandidate(candidate));
    }

    /// Force a connection-state transition, e.g. to simulate a drop.
    pub fn force_state(&self, state: TransportState) {
        *lock(&self.inner.connection_state) = state;
        self.inner.emit(TransportEvent::StateChanged(state));
    }

    pub fn trigger_negotiation_needed(&self) {
        self.inner.emit(TransportEvent::NegotiationNeeded);
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        if self.inner.fail_offer.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("injected offer failure".to_string()));
        }
        let mut state = lock(&self.inner.signaling_state);
        if *state != SignalingState::Stable {
            return Err(CallError::Negotiation(format!(
                "cannot offer in state {:?}",
                *state
            )));
        }
        *state = SignalingState::HaveLocalOffer;
        drop(state);
        self.inner.has_local.store(true, Ordering::SeqCst);
        let n = self.inner.sdp_counter.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.inner.label, n
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut state = lock(&self.inner.signaling_state);
        if *state != SignalingState::HaveRemoteOffer {
            return Err(CallError::Negotiation(format!(
                "cannot answer in state {:?}",
                *state
            )));
        }
        *state = SignalingState::Stable;
        drop(state);
        self.inner.has_local.store(true, Ordering::SeqCst);
        self.inner.maybe_connect();
        let n = self.inner.sdp_counter.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!(
            "answer-{}-{}",
            self.inner.label, n
        )))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut state = lock(&self.inner.signaling_state);
        match desc.kind {
            SdpKind::Offer => {
                // Glare: a remote offer cannot land on top of a local one.
                if *state == SignalingState::HaveLocalOffer {
                    return Err(CallError::Negotiation(
                        "remote offer while local offer pending".to_string(),
                    ));
                }
                *state = SignalingState::HaveRemoteOffer;
                drop(state);
                self.inner.has_remote.store(true, Ordering::SeqCst);
                Ok(())
            }
            SdpKind::Answer => {
                if *state != SignalingState::HaveLocalOffer {
                    return Err(CallError::Negotiation(
                        "answer without pending local offer".to_string(),
                    ));
                }
                *state = SignalingState::Stable;
                drop(state);
                self.inner.has_remote.store(true, Ordering::SeqCst);
                self.inner.maybe_connect();
                Ok(())
            }
            SdpKind::Rollback => Err(CallError::Negotiation(
                "rollback is not a remote description".to_string(),
            )),
        }
    }

    async fn rollback_local_description(&self) -> Result<(), CallError> {
        let mut state = lock(&self.inner.signaling_state);
        if *state != SignalingState::HaveLocalOffer {
            return Err(CallError::Negotiation(
                "nothing to roll back".to_string(),
            ));
        }
        *state = SignalingState::Stable;
        drop(state);
        self.inner.has_local.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        if !self.inner.has_remote.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        lock(&self.inner.applied_candidates).push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *lock(&self.inner.signaling_state)
    }

    fn connection_state(&self) -> TransportState {
        *lock(&self.inner.connection_state)
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), CallError> {
        lock(&self.inner.data_channels).push(label.to_string());
        Ok(())
    }

    async fn send_data(&self, label: &str, data: &str) -> Result<(), CallError> {
        if self.inner.fail_send_data.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation(
                "data channel not open".to_string(),
            ));
        }
        lock(&self.inner.sent_data).push((label.to_string(), data.to_string()));
        let linked = lock(&self.inner.linked).clone();
        if let Some(peer) = linked.and_then(|weak| weak.upgrade()) {
            peer.emit(TransportEvent::DataChannelMessage {
                label: label.to_string(),
                data: data.to_string(),
            });
        }
        Ok(())
    }

    async fn poll_stats(&self) -> Result<TransportStats, CallError> {
        Ok(lock(&self.inner.stats).clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    async fn close(&self) -> Result<(), CallError> {
        *lock(&self.inner.connection_state) = TransportState::Closed;
        Ok(())
    }
}

/// Hands out pre-scripted transports in order, then fresh defaults.
pub struct MockTransportFactory {
    scripted: Mutex<VecDeque<MockPeerTransport>>,
    created: Mutex<Vec<MockPeerTransport>>,
    fail_create: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn push_scripted(&self, transport: MockPeerTransport) {
        lock(&self.scripted).push_back(transport);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Transports handed out so far, in creation order.
    pub fn created(&self) -> Vec<MockPeerTransport> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(&self, _config: RtcConfig) -> Result<Box<dyn PeerTransport>, CallError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CallError::Media(
                "transport creation unavailable".to_string(),
            ));
        }
        let transport = lock(&self.scripted)
            .pop_front()
            .unwrap_or_else(|| MockPeerTransport::new("fresh"));
        lock(&self.created).push(transport.clone());
        Ok(Box::new(transport))
    }
}
