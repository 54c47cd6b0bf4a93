//! Weighted quality scoring and profile selection.
//!
//! The composite score is monotonic in every input factor: improving one
//! factor while holding the rest fixed never lowers the selected tier.

use crate::config::QualityConfig;
use crate::types::{
    CongestionLevel, NetworkConditions, PerformanceTier, QualityLevel, QualityProfile,
};

const SPEED_WEIGHT: f64 = 0.40;
const SIGNAL_WEIGHT: f64 = 0.25;
const CONGESTION_WEIGHT: f64 = 0.20;
const DEVICE_WEIGHT: f64 = 0.15;

/// Speed saturates at 10 Mbps; video above that gains nothing.
fn speed_factor(speed_mbps: f64) -> f64 {
    (speed_mbps.max(0.0) / 10.0).min(1.0) * 100.0
}

fn congestion_factor(level: CongestionLevel) -> f64 {
    match level {
        CongestionLevel::Low => 100.0,
        CongestionLevel::Medium => 60.0,
        CongestionLevel::High => 25.0,
    }
}

fn device_factor(tier: PerformanceTier) -> f64 {
    match tier {
        PerformanceTier::Excellent => 100.0,
        PerformanceTier::Good => 75.0,
        PerformanceTier::Fair => 50.0,
        PerformanceTier::Poor => 25.0,
    }
}

/// Composite 0-100 score: speed 40%, signal 25%, congestion 20%, device 15%,
/// minus a fixed penalty on mobile devices.
pub fn compute_score(conditions: &NetworkConditions, config: &QualityConfig) -> f64 {
    let mut score = SPEED_WEIGHT * speed_factor(conditions.speed_mbps)
        + SIGNAL_WEIGHT * f64::from(conditions.signal_strength)
        + CONGESTION_WEIGHT * congestion_factor(conditions.congestion)
        + DEVICE_WEIGHT * device_factor(conditions.device_performance);

    if conditions.is_mobile {
        score -= config.mobile_penalty;
    }

    score.clamp(0.0, 100.0)
}

/// Score bands: >=80 excellent, >=60 good, >=35 fair, else poor.
pub fn select_level(score: f64) -> QualityLevel {
    if score >= 80.0 {
        QualityLevel::Excellent
    } else if score >= 60.0 {
        QualityLevel::Good
    } else if score >= 35.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Full pipeline: conditions snapshot to concrete profile.
pub fn select_profile(conditions: &NetworkConditions, config: &QualityConfig) -> QualityProfile {
    QualityProfile::for_level(select_level(compute_score(conditions, config)))
}
