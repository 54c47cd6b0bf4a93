//! Configuration management for CrabConnect
//!
//! Provides configuration loading, saving, and management for negotiation
//! timing, quality adaptation, health/liveness tracking, and stats sampling.
//! Every interval and threshold used by the periodic subsystems lives here so
//! deployments (and tests) can tune them without code changes.

use crate::errors::CallError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub negotiation: NegotiationConfig,
    pub quality: QualityConfig,
    pub health: HealthConfig,
    pub stats: StatsConfig,
}

/// Negotiation engine timing and retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Bounded wait for the remote peer-joined signal before the initiator
    /// sends its offer anyway (milliseconds)
    pub offer_wait_ms: u64,
    /// Maximum reconnect attempts per call before reporting terminal failure
    pub max_reconnect_attempts: u32,
    /// Fixed reconnect delay on mobile devices (milliseconds)
    pub mobile_reconnect_delay_ms: u64,
    /// Per-attempt reconnect delay step on non-mobile devices (milliseconds);
    /// actual delay is step * attempt number
    pub desktop_reconnect_step_ms: u64,
    /// Label of the ordered data channel used for chat and mute signaling
    pub data_channel_label: String,
}

/// Quality controller behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Reassessment interval (milliseconds)
    pub reassess_interval_ms: u64,
    /// Fixed score penalty applied on mobile devices (0-100 scale)
    pub mobile_penalty: f64,
}

/// Heartbeat, health polling, and staleness thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat send interval (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Aggregate health poll interval (milliseconds)
    pub poll_interval_ms: u64,
    /// A peer whose last heartbeat is older than this is stale (milliseconds)
    pub staleness_threshold_ms: u64,
    /// Average latency above this triggers a poor-quality alert (milliseconds)
    pub poor_latency_threshold_ms: f64,
    /// Average packet loss above this triggers a poor-quality alert (percent)
    pub poor_loss_threshold_pct: f64,
}

/// Connection stats sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Transport stats poll interval while connected (milliseconds)
    pub sample_interval_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            negotiation: NegotiationConfig {
                offer_wait_ms: 5_000,
                max_reconnect_attempts: 2,
                mobile_reconnect_delay_ms: 2_000,
                desktop_reconnect_step_ms: 3_000,
                data_channel_label: "chat".to_string(),
            },
            quality: QualityConfig {
                reassess_interval_ms: 15_000,
                mobile_penalty: 10.0,
            },
            health: HealthConfig {
                heartbeat_interval_ms: 15_000,
                poll_interval_ms: 10_000,
                staleness_threshold_ms: 45_000,
                poor_latency_threshold_ms: 400.0,
                poor_loss_threshold_pct: 8.0,
            },
            stats: StatsConfig {
                sample_interval_ms: 3_000,
            },
        }
    }
}

impl CallConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CallError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("Failed to read config file: {}", e)))?;

        let config: CallConfig = toml::from_str(&contents)
            .map_err(|e| CallError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CallError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CallError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CallError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CallError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabconnect.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Reject configurations that would disable core liveness behavior
    pub fn validate(&self) -> Result<(), CallError> {
        if self.health.heartbeat_interval_ms == 0 || self.health.poll_interval_ms == 0 {
            return Err(CallError::Config(
                "heartbeat and health poll intervals must be non-zero".to_string(),
            ));
        }
        if self.health.staleness_threshold_ms < self.health.heartbeat_interval_ms {
            return Err(CallError::Config(
                "staleness threshold must be at least one heartbeat interval".to_string(),
            ));
        }
        if self.stats.sample_interval_ms == 0 {
            return Err(CallError::Config(
                "stats sample interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
