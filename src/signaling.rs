//! Signaling transport contract.
//!
//! The core exchanges offers, answers, ICE candidates, presence, and
//! coordination broadcasts over an ordered, at-least-once pub/sub channel
//! scoped to a session. The transport itself (websocket, hosted pub/sub,
//! in-memory hub for tests) is an external collaborator behind
//! [`SignalingTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::CallError;

/// Well-known envelope kinds used by the core.
pub mod kinds {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const PEER_JOINED: &str = "peer-joined";
    pub const BYE: &str = "bye";
    /// Broadcast by the selection winner; a latency optimization only.
    pub const PROVIDER_SELECTED: &str = "provider-selected";
    /// Urgent broadcast instructing every peer to switch providers.
    pub const COORDINATED_RECOVERY: &str = "coordinated-recovery";
}

/// Message destination: one peer or everyone in the session. Serialized as
/// the peer id, or the literal string `"all"` for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalTarget {
    Peer(String),
    All,
}

impl Serialize for SignalTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SignalTarget::Peer(id) => serializer.serialize_str(id),
            SignalTarget::All => serializer.serialize_str("all"),
        }
    }
}

impl<'de> Deserialize<'de> for SignalTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "all" {
            Ok(SignalTarget::All)
        } else {
            Ok(SignalTarget::Peer(s))
        }
    }
}

impl SignalTarget {
    pub fn includes(&self, peer_id: &str) -> bool {
        match self {
            SignalTarget::All => true,
            SignalTarget::Peer(id) => id == peer_id,
        }
    }
}

/// Wire envelope for all signaling traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: String,
    pub from: String,
    pub to: SignalTarget,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalEnvelope {
    pub fn to_peer(kind: &str, from: &str, to: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            from: from.to_string(),
            to: SignalTarget::Peer(to.to_string()),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(kind: &str, from: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            from: from.to_string(),
            to: SignalTarget::All,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered, at-least-once, session-scoped pub/sub channel between the two
/// participants. Delivery order is best-effort per sender.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join the session channel as the given peer.
    async fn connect(&self, session_id: &str, peer_id: &str) -> Result<(), CallError>;

    /// Send an addressed or broadcast envelope.
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), CallError>;

    /// Subscribe to envelopes addressed to this peer (or broadcast). Each
    /// call returns an independent receiver.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, CallError>;

    /// Leave the session channel. Idempotent.
    async fn disconnect(&self) -> Result<(), CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_broadcast_target_serializes_as_all() {
        let envelope = SignalEnvelope::broadcast(kinds::PEER_JOINED, "peer-a", Value::Null);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["to"], "all");
        assert_eq!(json["kind"], "peer-joined");
    }

    #[test]
    fn test_envelope_addressed_round_trip() {
        let envelope = SignalEnvelope::to_peer(
            kinds::OFFER,
            "peer-a",
            "peer-b",
            serde_json::json!({"sdp": "v=0"}),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to, SignalTarget::Peer("peer-b".to_string()));
        assert_eq!(parsed.payload["sdp"], "v=0");
    }

    #[test]
    fn test_target_includes() {
        assert!(SignalTarget::All.includes("anyone"));
        assert!(SignalTarget::Peer("x".into()).includes("x"));
        assert!(!SignalTarget::Peer("x".into()).includes("y"));
    }
}
