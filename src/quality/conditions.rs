//! Network-condition sampling with layered fallbacks.
//!
//! Every external signal source is optional. Absence of a source never
//! errors; the sampler degrades one layer at a time and bottoms out at
//! conservative fair/medium defaults.

use async_trait::async_trait;

use crate::types::{CongestionLevel, NetworkConditions, PerformanceTier};

/// Coarse connection type reported by the platform, used as a heuristic
/// when no direct measurement is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular4g,
    Cellular3g,
    Cellular2g,
}

/// Raw signal sources for condition sampling. Every method may return `None`;
/// implementations wrap whatever the platform happens to expose.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Platform-reported downlink estimate, Mbps.
    async fn downlink_mbps(&self) -> Option<f64>;

    /// Round-trip latency of a small synthetic fetch, milliseconds.
    async fn probe_latency_ms(&self) -> Option<f64>;

    /// Connection-type heuristic.
    async fn connection_type(&self) -> Option<ConnectionType>;

    /// Logical CPU count, if known.
    async fn cpu_cores(&self) -> Option<u32>;

    /// Device memory in GB, if known.
    async fn device_memory_gb(&self) -> Option<f64>;

    fn is_mobile(&self) -> bool;
}

/// Probe that reports nothing; sampling falls through to defaults.
pub struct NullProbe;

#[async_trait]
impl NetworkProbe for NullProbe {
    async fn downlink_mbps(&self) -> Option<f64> {
        None
    }
    async fn probe_latency_ms(&self) -> Option<f64> {
        None
    }
    async fn connection_type(&self) -> Option<ConnectionType> {
        None
    }
    async fn cpu_cores(&self) -> Option<u32> {
        None
    }
    async fn device_memory_gb(&self) -> Option<f64> {
        None
    }
    fn is_mobile(&self) -> bool {
        false
    }
}

fn speed_from_latency(latency_ms: f64) -> f64 {
    // Latency probe to speed bucket: fast round trips imply headroom.
    if latency_ms < 50.0 {
        25.0
    } else if latency_ms < 150.0 {
        10.0
    } else if latency_ms < 300.0 {
        4.0
    } else {
        1.5
    }
}

fn speed_from_connection_type(kind: ConnectionType) -> f64 {
    match kind {
        ConnectionType::Ethernet => 50.0,
        ConnectionType::Wifi => 20.0,
        ConnectionType::Cellular4g => 8.0,
        ConnectionType::Cellular3g => 2.0,
        ConnectionType::Cellular2g => 0.3,
    }
}

fn signal_from_latency(latency_ms: f64) -> u8 {
    if latency_ms < 50.0 {
        95
    } else if latency_ms < 100.0 {
        80
    } else if latency_ms < 200.0 {
        60
    } else if latency_ms < 400.0 {
        40
    } else {
        20
    }
}

fn signal_from_connection_type(kind: ConnectionType) -> u8 {
    match kind {
        ConnectionType::Ethernet => 95,
        ConnectionType::Wifi => 75,
        ConnectionType::Cellular4g => 60,
        ConnectionType::Cellular3g => 40,
        ConnectionType::Cellular2g => 20,
    }
}

fn congestion_from_latency(latency_ms: f64) -> CongestionLevel {
    if latency_ms < 100.0 {
        CongestionLevel::Low
    } else if latency_ms < 300.0 {
        CongestionLevel::Medium
    } else {
        CongestionLevel::High
    }
}

fn performance_tier(cores: Option<u32>, memory_gb: Option<f64>) -> PerformanceTier {
    match (cores, memory_gb) {
        (Some(c), Some(m)) if c >= 8 && m >= 8.0 => PerformanceTier::Excellent,
        (Some(c), Some(m)) if c >= 4 && m >= 4.0 => PerformanceTier::Good,
        (Some(c), _) if c >= 8 => PerformanceTier::Excellent,
        (Some(c), _) if c >= 4 => PerformanceTier::Good,
        (Some(_), _) => PerformanceTier::Fair,
        (None, Some(m)) if m >= 8.0 => PerformanceTier::Good,
        // No device signals at all: assume mid-tier.
        _ => PerformanceTier::Fair,
    }
}

/// Build a [`NetworkConditions`] snapshot from whatever the probe exposes.
///
/// Speed fallback chain: platform downlink estimate, synthetic-fetch latency
/// bucket, connection-type heuristic, then the static default.
pub async fn sample_conditions(probe: &dyn NetworkProbe) -> NetworkConditions {
    let defaults = NetworkConditions::default();

    let latency = probe.probe_latency_ms().await;
    let connection = probe.connection_type().await;

    let speed_mbps = if let Some(downlink) = probe.downlink_mbps().await {
        downlink
    } else if let Some(lat) = latency {
        speed_from_latency(lat)
    } else if let Some(kind) = connection {
        speed_from_connection_type(kind)
    } else {
        defaults.speed_mbps
    };

    let signal_strength = if let Some(lat) = latency {
        signal_from_latency(lat)
    } else if let Some(kind) = connection {
        signal_from_connection_type(kind)
    } else {
        defaults.signal_strength
    };

    let congestion = latency
        .map(congestion_from_latency)
        .unwrap_or(defaults.congestion);

    let device_performance = performance_tier(
        probe.cpu_cores().await,
        probe.device_memory_gb().await,
    );

    NetworkConditions {
        speed_mbps,
        signal_strength,
        congestion,
        device_performance,
        is_mobile: probe.is_mobile(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        downlink: Option<f64>,
        latency: Option<f64>,
        connection: Option<ConnectionType>,
        mobile: bool,
    }

    #[async_trait]
    impl NetworkProbe for FixedProbe {
        async fn downlink_mbps(&self) -> Option<f64> {
            self.downlink
        }
        async fn probe_latency_ms(&self) -> Option<f64> {
            self.latency
        }
        async fn connection_type(&self) -> Option<ConnectionType> {
            self.connection
        }
        async fn cpu_cores(&self) -> Option<u32> {
            None
        }
        async fn device_memory_gb(&self) -> Option<f64> {
            None
        }
        fn is_mobile(&self) -> bool {
            self.mobile
        }
    }

    #[tokio::test]
    async fn test_no_sources_yields_conservative_defaults() {
        let conditions = sample_conditions(&NullProbe).await;
        assert_eq!(conditions, NetworkConditions::default());
        assert_eq!(conditions.congestion, CongestionLevel::Medium);
        assert_eq!(conditions.device_performance, PerformanceTier::Fair);
    }

    #[tokio::test]
    async fn test_downlink_wins_over_other_layers() {
        let probe = FixedProbe {
            downlink: Some(42.0),
            latency: Some(500.0),
            connection: Some(ConnectionType::Cellular2g),
            mobile: false,
        };
        let conditions = sample_conditions(&probe).await;
        assert_eq!(conditions.speed_mbps, 42.0);
        // Latency still drives signal and congestion.
        assert_eq!(conditions.signal_strength, 20);
        assert_eq!(conditions.congestion, CongestionLevel::High);
    }

    #[tokio::test]
    async fn test_latency_bucket_fallback() {
        let probe = FixedProbe {
            downlink: None,
            latency: Some(40.0),
            connection: None,
            mobile: false,
        };
        let conditions = sample_conditions(&probe).await;
        assert_eq!(conditions.speed_mbps, 25.0);
        assert_eq!(conditions.congestion, CongestionLevel::Low);
    }

    #[tokio::test]
    async fn test_connection_type_fallback() {
        let probe = FixedProbe {
            downlink: None,
            latency: None,
            connection: Some(ConnectionType::Cellular3g),
            mobile: true,
        };
        let conditions = sample_conditions(&probe).await;
        assert_eq!(conditions.speed_mbps, 2.0);
        assert_eq!(conditions.signal_strength, 40);
        assert!(conditions.is_mobile);
    }
}
