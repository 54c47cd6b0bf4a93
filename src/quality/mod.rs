//! Adaptive call quality module
//!
//! Samples device/network signals with layered fallbacks, computes a
//! weighted quality score, selects a discrete resolution/frame-rate
//! profile, and applies it to the live video track.

pub mod conditions;
pub mod controller;
pub mod profiles;

pub use conditions::{sample_conditions, ConnectionType, NetworkProbe};
pub use controller::QualityController;
pub use profiles::{compute_score, select_level, select_profile};
