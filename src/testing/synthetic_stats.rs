//! Synthetic connection-stats streams for aggregation and recovery tests.

use crate::types::{classify_sample, ConnectionStats};

/// One synthetic stats sample with the quality label derived from the same
/// thresholds production sampling uses.
pub fn stats_sample(
    latency_ms: f64,
    packet_loss_pct: f64,
    bandwidth_kbps: f64,
    resolution: &str,
    frame_rate: f64,
) -> ConnectionStats {
    ConnectionStats {
        bandwidth_kbps,
        latency_ms,
        packet_loss_pct,
        quality: classify_sample(latency_ms, packet_loss_pct),
        resolution: resolution.to_string(),
        frame_rate,
        timestamp: chrono::Utc::now(),
    }
}

/// A steady excellent-quality stream.
pub fn steady_stream(count: usize) -> Vec<ConnectionStats> {
    (0..count)
        .map(|_| stats_sample(40.0, 0.2, 2500.0, "1280x720", 30.0))
        .collect()
}

/// A stream that degrades linearly from excellent to poor.
pub fn degrading_stream(count: usize) -> Vec<ConnectionStats> {
    (0..count)
        .map(|i| {
            let t = i as f64 / count.max(1) as f64;
            stats_sample(
                40.0 + t * 500.0,
                0.2 + t * 10.0,
                2500.0 - t * 2200.0,
                if t < 0.5 { "1280x720" } else { "640x360" },
                30.0 - t * 18.0,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityLevel;

    #[test]
    fn test_steady_stream_is_excellent() {
        assert!(steady_stream(5)
            .iter()
            .all(|s| s.quality == QualityLevel::Excellent));
    }

    #[test]
    fn test_degrading_stream_ends_poor() {
        let stream = degrading_stream(10);
        assert_eq!(stream.first().map(|s| s.quality), Some(QualityLevel::Excellent));
        assert_eq!(stream.last().map(|s| s.quality), Some(QualityLevel::Poor));
    }
}
