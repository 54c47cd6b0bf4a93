//! In-memory connection statistics buffering and session-end aggregation.
//!
//! Samples are buffered for the lifetime of a session and collapsed into one
//! [`SessionQualitySummary`] persisted exactly once through a [`SummarySink`].

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CallError;
use crate::types::{ConnectionStats, QualityLevel};

/// Aggregated min/avg/max for one numeric metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl MetricRange {
    fn from_values(values: impl Iterator<Item = f64> + Clone) -> MetricRange {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0u32;
        for v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        if count == 0 {
            MetricRange {
                min: 0.0,
                avg: 0.0,
                max: 0.0,
            }
        } else {
            MetricRange {
                min,
                avg: sum / f64::from(count),
                max,
            }
        }
    }
}

/// One aggregated summary per (session, peer), persisted at session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQualitySummary {
    pub session_id: String,
    pub peer_id: String,
    pub latency_ms: MetricRange,
    pub packet_loss_pct: MetricRange,
    pub bandwidth_kbps: MetricRange,
    pub frame_rate: MetricRange,
    /// Distinct resolutions observed, e.g. ["640x360", "1280x720"].
    pub resolutions: Vec<String>,
    /// Count of quality-label transitions in the sample stream.
    pub quality_changes: u32,
    pub connection_drops: u32,
    pub recovery_attempts: u32,
    pub overall_quality: QualityLevel,
    pub overall_score: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Seconds spent at good-or-better quality.
    pub good_duration_secs: f64,
    pub sample_count: u32,
}

/// Destination for the one-shot summary write.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn persist(&self, summary: &SessionQualitySummary) -> Result<(), CallError>;
}

/// Sink writing one JSON file per (session, peer).
pub struct JsonFileSink {
    directory: PathBuf,
}

impl JsonFileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl SummarySink for JsonFileSink {
    async fn persist(&self, summary: &SessionQualitySummary) -> Result<(), CallError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| CallError::Config(format!("Failed to create summary directory: {}", e)))?;

        let path = self
            .directory
            .join(format!("{}_{}.json", summary.session_id, summary.peer_id));
        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| CallError::Config(format!("Failed to serialize summary: {}", e)))?;

        tokio::fs::write(&path, json)
            .await
            .map_err(|e| CallError::Config(format!("Failed to write summary file: {}", e)))?;

        log::info!("Persisted session quality summary to {:?}", path);
        Ok(())
    }
}

/// Buffers periodic connection statistics for one session/peer and produces
/// the aggregated summary at session end.
pub struct StatsLogger {
    session_id: String,
    peer_id: String,
    samples: Vec<ConnectionStats>,
    connection_drops: u32,
    recovery_attempts: u32,
    started_at: DateTime<Utc>,
    /// Sample spacing used to convert sample counts to durations.
    sample_interval_secs: f64,
    finalized: bool,
}

impl StatsLogger {
    pub fn new(session_id: &str, peer_id: &str, sample_interval_secs: f64) -> Self {
        Self {
            session_id: session_id.to_string(),
            peer_id: peer_id.to_string(),
            samples: Vec::new(),
            connection_drops: 0,
            recovery_attempts: 0,
            started_at: Utc::now(),
            sample_interval_secs,
            finalized: false,
        }
    }

    pub fn record_sample(&mut self, sample: ConnectionStats) {
        self.samples.push(sample);
    }

    pub fn record_drop(&mut self) {
        self.connection_drops += 1;
    }

    pub fn record_recovery_attempt(&mut self) {
        self.recovery_attempts += 1;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Build the aggregate summary from the buffered stream.
    pub fn summarize(&self) -> SessionQualitySummary {
        let latency = MetricRange::from_values(self.samples.iter().map(|s| s.latency_ms));
        let loss = MetricRange::from_values(self.samples.iter().map(|s| s.packet_loss_pct));
        let bandwidth = MetricRange::from_values(self.samples.iter().map(|s| s.bandwidth_kbps));
        let frame_rate = MetricRange::from_values(self.samples.iter().map(|s| s.frame_rate));

        let resolutions: BTreeSet<String> = self
            .samples
            .iter()
            .filter(|s| !s.resolution.is_empty())
            .map(|s| s.resolution.clone())
            .collect();

        let quality_changes = self
            .samples
            .windows(2)
            .filter(|w| w[0].quality != w[1].quality)
            .count() as u32;

        let good_samples = self
            .samples
            .iter()
            .filter(|s| s.quality.is_good_or_better())
            .count() as f64;

        let overall_score = self.overall_score();
        let ended_at = Utc::now();

        SessionQualitySummary {
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            latency_ms: latency,
            packet_loss_pct: loss,
            bandwidth_kbps: bandwidth,
            frame_rate,
            resolutions: resolutions.into_iter().collect(),
            quality_changes,
            connection_drops: self.connection_drops,
            recovery_attempts: self.recovery_attempts,
            overall_quality: score_to_level(overall_score),
            overall_score,
            started_at: self.started_at,
            ended_at,
            duration_secs: (ended_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            good_duration_secs: good_samples * self.sample_interval_secs,
            sample_count: self.samples.len() as u32,
        }
    }

    /// Average per-sample quality expressed on the 0-100 scale, penalized by
    /// drops and recoveries.
    fn overall_score(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let base: f64 = self
            .samples
            .iter()
            .map(|s| match s.quality {
                QualityLevel::Excellent => 95.0,
                QualityLevel::Good => 75.0,
                QualityLevel::Fair => 50.0,
                QualityLevel::Poor => 20.0,
            })
            .sum::<f64>()
            / self.samples.len() as f64;

        let penalty = f64::from(self.connection_drops) * 5.0
            + f64::from(self.recovery_attempts) * 3.0;
        (base - penalty).clamp(0.0, 100.0)
    }

    /// Summarize and persist exactly once. A second call fails with
    /// [`CallError::AlreadyFinalized`] and performs no write.
    pub async fn finalize(
        &mut self,
        sink: &dyn SummarySink,
    ) -> Result<SessionQualitySummary, CallError> {
        if self.finalized {
            return Err(CallError::AlreadyFinalized(self.session_id.clone()));
        }
        let summary = self.summarize();
        sink.persist(&summary).await?;
        self.finalized = true;
        Ok(summary)
    }
}

fn score_to_level(score: f64) -> QualityLevel {
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
