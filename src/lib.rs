//! CrabConnect: two-party video call core with coordinated provider failover
//!
//! This crate implements the connection layer of a peer-to-peer video call:
//! glare-resistant offer/answer negotiation, atomic provider selection with
//! mid-call recovery, liveness tracking, adaptive quality, and session stats
//! aggregation. The WebRTC runtime, signaling channel, and coordination
//! backend all sit behind traits, so the whole call flow runs unchanged
//! against in-memory fakes.
//!
//! # Features
//! - Deterministic polite/impolite role derivation from peer ids
//! - Perfect Negotiation glare handling with bounded reconnects
//! - Atomic, idempotent provider selection and coordinated recovery
//! - Heartbeat liveness with backend-computed staleness
//! - Adaptive quality profiles applied to the live video track
//! - Per-session quality summaries persisted on teardown
//!
//! # Usage
//! ```rust,ignore
//! use crabconnect::{CallConfig, ManagerDeps, PeerIdentity, VideoCallManager};
//!
//! let (manager, mut events) = VideoCallManager::new(
//!     "session-1",
//!     PeerIdentity::new("peer-a", "Alice"),
//!     "peer-b",
//!     device_info,
//!     CallConfig::default(),
//!     deps,
//! );
//! let provider = manager.start_call().await?;
//! ```

pub mod config;
pub mod coordination;
pub mod errors;
pub mod invariant_ppt;
pub mod manager;
pub mod media;
pub mod negotiation;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod types;

// Testing utilities - in-memory doubles for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::CallConfig;
pub use errors::CallError;
pub use manager::{CallPhase, HostedCallClient, ManagerDeps, MediaEngine, VideoCallManager};
pub use negotiation::{ChatMessage, EngineEvent, NegotiationEngine};
pub use types::{
    ConnectionState, ConnectionStats, DeviceInfo, NegotiationRole, PeerIdentity, PeerRole,
    QualityLevel, QualityProfile, VideoProvider,
};

/// Initialize logging for the call core
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabconnect=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
