//! Abstractions over the underlying WebRTC-capable runtime.
//!
//! The negotiation engine never talks to a concrete peer-connection or
//! capture API. It drives [`PeerTransport`] / [`MediaSource`] trait objects,
//! which keeps the protocol logic portable across browser and native
//! runtimes and lets tests substitute scripted transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::CallError;
use crate::types::QualityProfile;

/// SDP description kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate: one connectivity option exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// ICE server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Peer transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

/// Signaling state of the local description machine, as reported by the
/// transport. Offer collisions are detected against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Connection state of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Raw transport-level statistics, one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub inbound_bitrate_kbps: f64,
    pub frame_rate: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Round-trip time of the active candidate pair.
    pub rtt_ms: f64,
    pub packet_loss_pct: f64,
}

/// Events emitted by a peer transport instance.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// Locally gathered ICE candidate ready to signal to the remote peer.
    LocalCandidate(IceCandidate),
    /// The transport wants a (re)negotiation; follows the same offer path.
    NegotiationNeeded,
    /// Remote-created data channel became available (responder side).
    DataChannelOpened(String),
    DataChannelMessage { label: String, data: String },
}

/// One peer-connection instance. Created per connection attempt and recreated
/// wholesale on reconnect, never reused across attempts.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    /// Create an answer to the current remote offer and set it locally.
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    /// Roll back a locally pending offer (polite peer during glare).
    async fn rollback_local_description(&self) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> TransportState;

    /// Create an ordered data channel (initiator side).
    async fn create_data_channel(&self, label: &str) -> Result<(), CallError>;

    async fn send_data(&self, label: &str, data: &str) -> Result<(), CallError>;

    async fn poll_stats(&self) -> Result<TransportStats, CallError>;

    /// Subscribe to transport events. Each call returns an independent receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Close the transport. Idempotent.
    async fn close(&self) -> Result<(), CallError>;
}

/// Factory for peer transports, so reconnects tear down and recreate the
/// transport object instead of mutating a live one.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, config: RtcConfig) -> Result<Box<dyn PeerTransport>, CallError>;
}

/// Constraint set applied to a live video track when the quality profile
/// changes. `frame_rate` is absent in the degraded fallback set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConstraints {
    pub width: u32,
    pub height: u32,
    pub ideal_fps: Option<f64>,
    pub max_fps: Option<f64>,
}

impl TrackConstraints {
    pub fn from_profile(profile: &QualityProfile) -> Self {
        Self {
            width: profile.width,
            height: profile.height,
            ideal_fps: Some(profile.ideal_fps),
            max_fps: Some(profile.max_fps),
        }
    }

    /// Width/height-only fallback for runtimes that reject the full set.
    pub fn dimensions_only(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            ideal_fps: None,
            max_fps: None,
        }
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A live local media track (audio or video).
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Enable or disable the track (mute/unmute). Returns the new enabled state.
    async fn set_enabled(&self, enabled: bool) -> Result<bool, CallError>;

    fn is_enabled(&self) -> bool;

    /// Apply updated constraints to the existing track. Never recreates it.
    async fn apply_constraints(&self, constraints: TrackConstraints) -> Result<(), CallError>;

    /// Stop capture and release the device. Idempotent.
    async fn stop(&self) -> Result<(), CallError>;
}

/// Media capture device abstraction. Acquisition failure (permission denied,
/// device missing) is fatal for the connection attempt and never retried.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<std::sync::Arc<dyn MediaTrack>>, CallError>;
}
