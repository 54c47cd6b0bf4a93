use thiserror::Error;

/// Error taxonomy for the call core.
///
/// Negotiation and provider failures are normally absorbed and retried
/// internally; only retry exhaustion or media-acquisition failure reaches
/// the caller. Coordination-backend failures degrade to local fallback
/// rules instead of propagating.
#[derive(Debug, Error)]
pub enum CallError {
    /// SDP/ICE apply failure. Retried via reconnect, never fatal per-occurrence.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Permission denied or device missing. Fatal for the attempt, not retried.
    #[error("media acquisition error: {0}")]
    Media(String),

    /// Provider unreachable or failed mid-call. Triggers coordinated recovery.
    #[error("provider error: {0}")]
    Provider(String),

    /// Coordination backend RPC failure.
    #[error("coordination backend error: {0}")]
    Coordination(String),

    /// Signaling transport failure.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Operation not supported by the active media engine.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Configuration load/save/validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Session summary was already persisted.
    #[error("session summary already finalized for session {0}")]
    AlreadyFinalized(String),
}

impl CallError {
    /// Whether the error represents a transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Negotiation(_) | CallError::Provider(_) | CallError::Signaling(_)
        )
    }
}
