//! Per-subscriber quality selection
//!
//! Answers "which simulcast layer should this subscriber get right now?".
//! The subscriber's estimated bandwidth is partitioned across its inbound
//! tracks: audio gets a fixed budget per track, non-simulcast video a fixed
//! budget per track, and the remainder is split evenly among the simulcast
//! streams. The per-stream share then maps to a layer through the
//! configured thresholds.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::config::BitrateConfig;
use crate::types::QualityLevel;

/// Default consumer bandwidth assumed until the signaling layer reports one.
pub const DEFAULT_BANDWIDTH_KBPS: u32 = 2500;

/// How many inbound tracks a subscriber currently consumes, by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackCounts {
    pub audio: u32,
    pub video: u32,
    pub simulcast: u32,
}

/// Which simulcast layers currently have packets flowing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerActivity {
    pub high: bool,
    pub mid: bool,
    pub low: bool,
}

impl LayerActivity {
    #[must_use]
    pub const fn is_active(&self, quality: QualityLevel) -> bool {
        match quality {
            QualityLevel::High => self.high,
            QualityLevel::Mid => self.mid,
            QualityLevel::Low => self.low,
            QualityLevel::None => false,
        }
    }

    /// First active layer in High → Mid → Low order.
    #[must_use]
    pub const fn best_active(&self) -> QualityLevel {
        if self.high {
            QualityLevel::High
        } else if self.mid {
            QualityLevel::Mid
        } else if self.low {
            QualityLevel::Low
        } else {
            QualityLevel::None
        }
    }
}

/// Quality selector for one subscriber.
pub struct BitrateController {
    bitrates: BitrateConfig,
    bandwidth_kbps: AtomicU32,
}

impl BitrateController {
    #[must_use]
    pub fn new(bitrates: BitrateConfig) -> Self {
        Self {
            bitrates,
            bandwidth_kbps: AtomicU32::new(DEFAULT_BANDWIDTH_KBPS),
        }
    }

    /// Updates the subscriber's bandwidth estimate, in kbit/s.
    pub fn set_bandwidth(&self, kbps: u32) {
        self.bandwidth_kbps.store(kbps, Ordering::Relaxed);
    }

    #[must_use]
    pub fn bandwidth(&self) -> u32 {
        self.bandwidth_kbps.load(Ordering::Relaxed)
    }

    /// The per-stream share left after the fixed audio and video budgets.
    fn distributed_share(&self, counts: TrackCounts) -> u32 {
        let left = self
            .bandwidth()
            .saturating_sub(counts.audio * self.bitrates.audio)
            .saturating_sub(counts.video * self.bitrates.video);
        left / counts.simulcast.max(1)
    }

    /// Picks the layer for one simulcast stream, falling back through the
    /// active layers when the computed choice is not flowing.
    #[must_use]
    pub fn quality(&self, counts: TrackCounts, activity: LayerActivity) -> QualityLevel {
        let share = self.distributed_share(counts);
        if share == 0 {
            return QualityLevel::None;
        }

        let chosen = if share > self.bitrates.video_high {
            QualityLevel::High
        } else if share > self.bitrates.video_mid {
            QualityLevel::Mid
        } else {
            QualityLevel::Low
        };

        if activity.is_active(chosen) {
            chosen
        } else {
            activity.best_active()
        }
    }
}

/// Sliding-window bitrate estimate over the packets of one inbound track.
pub struct BitrateEstimator {
    window: Duration,
    samples: Mutex<Vec<(Instant, usize)>>,
}

impl BitrateEstimator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, bytes: usize) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push((now, bytes));
        if let Some(cutoff) = now.checked_sub(self.window) {
            samples.retain(|(at, _)| *at >= cutoff);
        }
    }

    /// Smoothed rate over the window, in kbit/s.
    #[must_use]
    pub fn kbps(&self) -> u32 {
        let mut samples = self.samples.lock();
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            samples.retain(|(at, _)| *at >= cutoff);
        }
        let bytes: usize = samples.iter().map(|(_, b)| b).sum();
        let bits = bytes as u64 * 8;
        (bits / self.window.as_millis().max(1) as u64) as u32
    }
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIVE: LayerActivity = LayerActivity {
        high: true,
        mid: true,
        low: true,
    };

    fn controller(kbps: u32) -> BitrateController {
        let controller = BitrateController::new(BitrateConfig::default());
        controller.set_bandwidth(kbps);
        controller
    }

    #[test]
    fn plenty_of_bandwidth_selects_high() {
        let counts = TrackCounts {
            audio: 1,
            video: 0,
            simulcast: 1,
        };
        assert_eq!(
            controller(3000).quality(counts, ALL_ACTIVE),
            QualityLevel::High
        );
    }

    #[test]
    fn bandwidth_drop_walks_down_the_layers() {
        // A collapsing consumer bandwidth estimate steps the choice down:
        // 3000 - 48 = 2952 (high), 900 - 48 = 852 (mid), 500 - 48 = 452 (low).
        let counts = TrackCounts {
            audio: 1,
            video: 0,
            simulcast: 1,
        };
        let controller = controller(3000);
        assert_eq!(controller.quality(counts, ALL_ACTIVE), QualityLevel::High);

        controller.set_bandwidth(900);
        assert_eq!(controller.quality(counts, ALL_ACTIVE), QualityLevel::Mid);

        controller.set_bandwidth(500);
        assert_eq!(controller.quality(counts, ALL_ACTIVE), QualityLevel::Low);
    }

    #[test]
    fn mid_band_selects_mid() {
        let counts = TrackCounts {
            audio: 0,
            video: 0,
            simulcast: 1,
        };
        assert_eq!(
            controller(1000).quality(counts, ALL_ACTIVE),
            QualityLevel::Mid
        );
    }

    #[test]
    fn audio_and_video_budgets_come_off_the_top() {
        // 2000 kbit/s minus 2 audio (96) and 1 plain video (600) leaves
        // 1304, split across 2 simulcast streams: 652 each, mid band.
        let counts = TrackCounts {
            audio: 2,
            video: 1,
            simulcast: 2,
        };
        assert_eq!(
            controller(2000).quality(counts, ALL_ACTIVE),
            QualityLevel::Mid
        );
    }

    #[test]
    fn exhausted_bandwidth_selects_none() {
        let counts = TrackCounts {
            audio: 4,
            video: 2,
            simulcast: 1,
        };
        assert_eq!(
            controller(500).quality(counts, ALL_ACTIVE),
            QualityLevel::None
        );
    }

    #[test]
    fn inactive_choice_falls_back_to_best_active() {
        let counts = TrackCounts {
            audio: 0,
            video: 0,
            simulcast: 1,
        };
        let only_low = LayerActivity {
            high: false,
            mid: false,
            low: true,
        };
        assert_eq!(
            controller(5000).quality(counts, only_low),
            QualityLevel::Low
        );

        let nothing = LayerActivity::default();
        assert_eq!(
            controller(5000).quality(counts, nothing),
            QualityLevel::None
        );
    }

    #[test]
    fn estimator_tracks_recorded_bytes() {
        let estimator = BitrateEstimator::new(Duration::from_secs(1));
        assert_eq!(estimator.kbps(), 0);

        // 125 kB over a 1 s window is 1000 kbit/s.
        for _ in 0..125 {
            estimator.record(1000);
        }
        let kbps = estimator.kbps();
        assert!((900..=1100).contains(&kbps), "got {kbps}");
    }
}
