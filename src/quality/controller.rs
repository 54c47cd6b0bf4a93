//! Adaptive quality controller.
//!
//! Owns the current quality profile and network-conditions snapshot,
//! recomputes on a fixed interval and on demand, and applies profile changes
//! to the live video track. Subscribers are notified only when the selected
//! tier changes, not on every sample.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::QualityConfig;
use crate::media::{MediaTrack, TrackConstraints};
use crate::quality::conditions::{sample_conditions, NetworkProbe};
use crate::quality::profiles::select_profile;
use crate::types::{NetworkConditions, QualityProfile};

pub struct QualityController {
    probe: Arc<dyn NetworkProbe>,
    config: QualityConfig,
    conditions: Arc<RwLock<NetworkConditions>>,
    current: Arc<RwLock<QualityProfile>>,
    video_track: Arc<RwLock<Option<Arc<dyn MediaTrack>>>>,
    profile_tx: watch::Sender<QualityProfile>,
    change_count: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QualityController {
    pub fn new(probe: Arc<dyn NetworkProbe>, config: QualityConfig) -> Self {
        let initial_conditions = NetworkConditions::default();
        let initial = select_profile(&initial_conditions, &config);
        let (profile_tx, _) = watch::channel(initial);

        Self {
            probe,
            config,
            conditions: Arc::new(RwLock::new(initial_conditions)),
            current: Arc::new(RwLock::new(initial)),
            video_track: Arc::new(RwLock::new(None)),
            profile_tx,
            change_count: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Attach the live video track the controller adapts. Constraints are
    /// always applied to this track in place; it is never recreated.
    pub async fn attach_track(&self, track: Arc<dyn MediaTrack>) {
        *self.video_track.write().await = Some(track);
    }

    pub async fn detach_track(&self) {
        *self.video_track.write().await = None;
    }

    /// Receiver that observes profile-tier changes only.
    pub fn subscribe(&self) -> watch::Receiver<QualityProfile> {
        self.profile_tx.subscribe()
    }

    pub async fn current_profile(&self) -> QualityProfile {
        *self.current.read().await
    }

    pub async fn current_conditions(&self) -> NetworkConditions {
        self.conditions.read().await.clone()
    }

    /// Number of tier changes observed so far (feeds the session summary).
    pub fn quality_change_count(&self) -> u32 {
        self.change_count.load(Ordering::Relaxed)
    }

    /// Sample conditions and apply a profile change if the tier moved.
    pub async fn reassess_now(&self) -> QualityProfile {
        let sampled = sample_conditions(self.probe.as_ref()).await;
        let selected = select_profile(&sampled, &self.config);

        *self.conditions.write().await = sampled;

        let changed = {
            let mut current = self.current.write().await;
            if current.level != selected.level {
                log::info!(
                    "Quality profile changing {} -> {}",
                    current.level.as_str(),
                    selected.level.as_str()
                );
                *current = selected;
                true
            } else {
                false
            }
        };

        if changed {
            self.change_count.fetch_add(1, Ordering::Relaxed);
            self.apply_profile(&selected).await;
            // Receivers may have gone away; that is not an error.
            let _ = self.profile_tx.send(selected);
        }

        selected
    }

    /// Apply the profile to the attached track, degrading to width/height-only
    /// constraints if the runtime rejects the full set.
    async fn apply_profile(&self, profile: &QualityProfile) {
        let track = { self.video_track.read().await.clone() };
        let Some(track) = track else {
            return;
        };

        let constraints = TrackConstraints::from_profile(profile);
        if let Err(e) = track.apply_constraints(constraints.clone()).await {
            log::warn!(
                "Full constraint set rejected ({}), retrying with dimensions only",
                e
            );
            if let Err(e) = track.apply_constraints(constraints.dimensions_only()).await {
                log::warn!("Constraint fallback also rejected: {}", e);
            }
        }
    }

    /// Start the periodic reassessment task. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let controller = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.config.reassess_interval_ms);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so start() returns before
            // the first reassessment.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.reassess_now().await;
            }
        }));
    }

    /// Cancel the periodic task. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::conditions::{ConnectionType, NullProbe};
    use crate::types::QualityLevel;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn config() -> QualityConfig {
        QualityConfig {
            reassess_interval_ms: 15_000,
            mobile_penalty: 10.0,
        }
    }

    struct SwitchingProbe {
        degraded: AtomicBool,
    }

    #[async_trait]
    impl NetworkProbe for SwitchingProbe {
        async fn downlink_mbps(&self) -> Option<f64> {
            if self.degraded.load(Ordering::Relaxed) {
                Some(0.5)
            } else {
                Some(50.0)
            }
        }
        async fn probe_latency_ms(&self) -> Option<f64> {
            if self.degraded.load(Ordering::Relaxed) {
                Some(600.0)
            } else {
                Some(30.0)
            }
        }
        async fn connection_type(&self) -> Option<ConnectionType> {
            None
        }
        async fn cpu_cores(&self) -> Option<u32> {
            Some(8)
        }
        async fn device_memory_gb(&self) -> Option<f64> {
            Some(16.0)
        }
        fn is_mobile(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_reassess_selects_excellent_on_strong_network() {
        let probe = Arc::new(SwitchingProbe {
            degraded: AtomicBool::new(false),
        });
        let controller = QualityController::new(probe, config());
        let profile = controller.reassess_now().await;
        assert_eq!(profile.level, QualityLevel::Excellent);
    }

    #[tokio::test]
    async fn test_subscribers_notified_only_on_tier_change() {
        let probe = Arc::new(SwitchingProbe {
            degraded: AtomicBool::new(false),
        });
        let probe_handle = Arc::clone(&probe);
        let controller = QualityController::new(probe, config());
        let mut rx = controller.subscribe();
        rx.mark_unchanged();

        // First reassessment moves the default tier up: one notification.
        controller.reassess_now().await;
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        // Same conditions again: tier unchanged, no notification.
        controller.reassess_now().await;
        assert!(!rx.has_changed().unwrap());

        // Degrade the network: tier drops, notification fires.
        probe_handle.degraded.store(true, Ordering::Relaxed);
        controller.reassess_now().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().level, QualityLevel::Poor);
        assert_eq!(controller.quality_change_count(), 2);
    }

    #[tokio::test]
    async fn test_null_probe_never_panics() {
        let controller = QualityController::new(Arc::new(NullProbe), config());
        let profile = controller.reassess_now().await;
        // Conservative defaults land mid-band.
        assert_eq!(profile.level, QualityLevel::Good);
    }
}
