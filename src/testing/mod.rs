//! In-memory test doubles for every external seam.
//!
//! Everything here is deterministic and clock-free: staleness is injected,
//! transport state is driven explicitly, and the signaling hub preserves
//! per-sender order. Used by unit tests and the integration suite; none of
//! it is compiled into release binaries by callers that do not ask for it.

pub mod mock_backend;
pub mod mock_media;
pub mod mock_signaling;
pub mod synthetic_stats;

pub use mock_backend::{InMemoryCoordination, MockHostedClient};
pub use mock_media::{
    MockMediaSource, MockMediaTrack, MockPeerTransport, MockTransportFactory,
};
pub use mock_signaling::{MockSignaling, SignalingHub};
pub use synthetic_stats::{degrading_stream, stats_sample, steady_stream};
