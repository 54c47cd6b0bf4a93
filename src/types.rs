//! Core data model for peer-to-peer call sessions.
//!
//! Identities, deterministic role derivation, provider and connection state
//! enums, network-condition snapshots, and the quality profile table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A participant in a two-peer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Opaque session-scoped identifier.
    pub id: String,
    /// Human-readable display name.
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Who drives the initial offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// Glare-resolution role (Perfect Negotiation). The polite peer yields
/// during an offer collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Polite,
    Impolite,
}

/// Derive `(PeerRole, NegotiationRole)` for the local peer from the two ids.
///
/// Pure and symmetric: both peers compute complementary roles independently,
/// with no coordination. Lexicographically lower id is the initiator; the
/// higher id is the polite peer.
pub fn derive_roles(local_id: &str, remote_id: &str) -> (PeerRole, NegotiationRole) {
    let roles = if local_id < remote_id {
        (PeerRole::Initiator, NegotiationRole::Impolite)
    } else {
        (PeerRole::Responder, NegotiationRole::Polite)
    };
    crate::assert_invariant!(
        matches!(
            roles,
            (PeerRole::Initiator, NegotiationRole::Impolite)
                | (PeerRole::Responder, NegotiationRole::Polite)
        ),
        "initiator pairs with the impolite role",
        "roles"
    );
    roles
}

/// Transport providers a session can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoProvider {
    P2p,
    Daily,
}

impl VideoProvider {
    /// The deterministic local fallback: the other of the two known providers.
    pub fn alternate(&self) -> VideoProvider {
        match self {
            VideoProvider::P2p => VideoProvider::Daily,
            VideoProvider::Daily => VideoProvider::P2p,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoProvider::P2p => "p2p",
            VideoProvider::Daily => "daily",
        }
    }
}

impl std::fmt::Display for VideoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of how the session's provider was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub selected_by: String,
    pub selected_at: DateTime<Utc>,
    /// Set when this selection is the result of a coordinated recovery.
    pub recovered_from: Option<VideoProvider>,
    pub reason: String,
}

/// A two-peer call session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// `None` until a provider has been selected.
    pub active_provider: Option<VideoProvider>,
    pub room_id: Option<String>,
    pub selection: Option<SelectionRecord>,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            active_provider: None,
            room_id: None,
            selection: None,
        }
    }
}

/// Per-connection-instance lifecycle. `Failed` and `Ended` are terminal for
/// the instance; a retry creates a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Ended,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Ended => "ended",
        }
    }
}

/// Network congestion bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

/// Coarse device performance tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Snapshot of observed network/device conditions, input to quality scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Estimated downlink speed in Mbps.
    pub speed_mbps: f64,
    /// Signal strength 0-100.
    pub signal_strength: u8,
    pub congestion: CongestionLevel,
    pub device_performance: PerformanceTier,
    pub is_mobile: bool,
}

impl Default for NetworkConditions {
    /// Conservative defaults used when every probe source is absent.
    fn default() -> Self {
        Self {
            speed_mbps: 10.0,
            signal_strength: 50,
            congestion: CongestionLevel::Medium,
            device_performance: PerformanceTier::Fair,
            is_mobile: false,
        }
    }
}

/// Discrete quality tier. Ordered: `Poor < Fair < Good < Excellent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Poor => "poor",
            QualityLevel::Fair => "fair",
            QualityLevel::Good => "good",
            QualityLevel::Excellent => "excellent",
        }
    }

    /// Good-or-better is the band counted toward "good duration" in the
    /// session summary.
    pub fn is_good_or_better(&self) -> bool {
        *self >= QualityLevel::Good
    }
}

/// Fixed (resolution, frame-rate range) pair for a quality tier.
///
/// Bitrate is intentionally absent; the transport's congestion control owns it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub level: QualityLevel,
    pub width: u32,
    pub height: u32,
    pub min_fps: f64,
    pub ideal_fps: f64,
    pub max_fps: f64,
}

impl QualityProfile {
    /// The fixed profile table.
    pub fn for_level(level: QualityLevel) -> QualityProfile {
        match level {
            QualityLevel::Excellent => QualityProfile {
                level,
                width: 1280,
                height: 720,
                min_fps: 24.0,
                ideal_fps: 30.0,
                max_fps: 30.0,
            },
            QualityLevel::Good => QualityProfile {
                level,
                width: 960,
                height: 540,
                min_fps: 20.0,
                ideal_fps: 25.0,
                max_fps: 30.0,
            },
            QualityLevel::Fair => QualityProfile {
                level,
                width: 640,
                height: 360,
                min_fps: 15.0,
                ideal_fps: 20.0,
                max_fps: 24.0,
            },
            QualityLevel::Poor => QualityProfile {
                level,
                width: 320,
                height: 240,
                min_fps: 8.0,
                ideal_fps: 12.0,
                max_fps: 15.0,
            },
        }
    }
}

/// One connection statistics sample, derived from transport-level stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bandwidth_kbps: f64,
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub quality: QualityLevel,
    /// e.g. "1280x720". Empty when the transport reports no video yet.
    pub resolution: String,
    pub frame_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Classify one stats sample into a discrete quality tier.
///
/// Thresholds: >400ms latency or >8% loss is poor; <100ms and <1% is
/// excellent; <200ms and <3% is good; the remainder is fair.
pub fn classify_sample(latency_ms: f64, packet_loss_pct: f64) -> QualityLevel {
    if latency_ms > 400.0 || packet_loss_pct > 8.0 {
        QualityLevel::Poor
    } else if latency_ms < 100.0 && packet_loss_pct < 1.0 {
        QualityLevel::Excellent
    } else if latency_ms < 200.0 && packet_loss_pct < 3.0 {
        QualityLevel::Good
    } else {
        QualityLevel::Fair
    }
}

/// Device description pushed with peer-state updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub is_mobile: bool,
}
