//! Adaptive quality monitoring
//!
//! Consumes network metrics samples, classifies connection quality over a
//! sliding window and recommends a video configuration. Recommendations
//! move along a fixed preset ladder with hysteresis so a single bad sample
//! never causes a quality swing.

use crate::config::VideoCodec;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;

/// Number of samples retained for averaging.
const WINDOW_CAPACITY: usize = 10;

/// Consecutive POOR classifications required before stepping down.
const POOR_STREAK_LIMIT: u32 = 3;

/// Mean bandwidth above which an EXCELLENT connection jumps straight to ULTRA.
const ULTRA_BANDWIDTH_BPS: f64 = 3_000_000.0;

/// One sample from the metrics collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkMetrics {
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Packet loss fraction, 0.0 to 1.0.
    pub packet_loss: f64,
    /// Estimated bandwidth in bits per second.
    pub bandwidth_bps: f64,
    /// Jitter in milliseconds.
    pub jitter_ms: f64,
    /// Sample time, milliseconds since the epoch.
    pub timestamp: i64,
}

/// Ordinal connection quality scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        }
    }
}

/// Canonical video configuration ladder. Recommendations only ever move
/// along these four presets, one rung at a time except the bandwidth-gated
/// jump to `Ultra`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    pub fn step_up(self) -> Self {
        match self {
            QualityPreset::Low => QualityPreset::Medium,
            QualityPreset::Medium => QualityPreset::High,
            QualityPreset::High => QualityPreset::Ultra,
            QualityPreset::Ultra => QualityPreset::Ultra,
        }
    }

    pub fn step_down(self) -> Self {
        match self {
            QualityPreset::Ultra => QualityPreset::High,
            QualityPreset::High => QualityPreset::Medium,
            QualityPreset::Medium => QualityPreset::Low,
            QualityPreset::Low => QualityPreset::Low,
        }
    }

    /// The concrete capture parameters for this preset.
    pub fn video_config(self, codec: VideoCodec) -> VideoConfig {
        match self {
            QualityPreset::Low => VideoConfig {
                width: 640,
                height: 360,
                frame_rate: 15,
                bitrate: 400_000,
                codec,
            },
            QualityPreset::Medium => VideoConfig {
                width: 1280,
                height: 720,
                frame_rate: 24,
                bitrate: 1_200_000,
                codec,
            },
            QualityPreset::High => VideoConfig {
                width: 1920,
                height: 1080,
                frame_rate: 30,
                bitrate: 2_500_000,
                codec,
            },
            QualityPreset::Ultra => VideoConfig {
                width: 2560,
                height: 1440,
                frame_rate: 60,
                bitrate: 4_000_000,
                codec,
            },
        }
    }
}

/// Target video configuration sent to the capturing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub codec: VideoCodec,
}

struct MonitorInner {
    window: VecDeque<NetworkMetrics>,
    consecutive_poor: u32,
    preset: QualityPreset,
}

struct WindowAverages {
    rtt_ms: f64,
    packet_loss: f64,
    bandwidth_bps: f64,
    jitter_ms: f64,
}

fn average(window: &VecDeque<NetworkMetrics>) -> WindowAverages {
    let count = window.len().max(1) as f64;
    WindowAverages {
        rtt_ms: window.iter().map(|m| m.rtt_ms).sum::<f64>() / count,
        packet_loss: window.iter().map(|m| m.packet_loss).sum::<f64>() / count,
        bandwidth_bps: window.iter().map(|m| m.bandwidth_bps).sum::<f64>() / count,
        jitter_ms: window.iter().map(|m| m.jitter_ms).sum::<f64>() / count,
    }
}

/// Both threshold conditions must hold for a bucket; failing either one
/// drops the classification to the next bucket down.
fn classify(avg: &WindowAverages) -> ConnectionQuality {
    if avg.rtt_ms < 50.0 && avg.packet_loss < 0.01 {
        ConnectionQuality::Excellent
    } else if avg.rtt_ms < 150.0 && avg.packet_loss < 0.05 {
        ConnectionQuality::Good
    } else if avg.rtt_ms < 300.0 && avg.packet_loss < 0.10 {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    }
}

/// Sliding-window quality monitor.
///
/// Classification and the recommended configuration are published as two
/// independent watch cells; consumers may observe either without the other.
pub struct QualityMonitor {
    codec: VideoCodec,
    inner: Mutex<MonitorInner>,
    quality_tx: watch::Sender<ConnectionQuality>,
    config_tx: watch::Sender<VideoConfig>,
}

impl QualityMonitor {
    pub fn new(codec: VideoCodec) -> Self {
        let (quality_tx, _) = watch::channel(ConnectionQuality::Good);
        let (config_tx, _) = watch::channel(QualityPreset::Medium.video_config(codec));
        Self {
            codec,
            inner: Mutex::new(MonitorInner {
                window: VecDeque::with_capacity(WINDOW_CAPACITY),
                consecutive_poor: 0,
                preset: QualityPreset::Medium,
            }),
            quality_tx,
            config_tx,
        }
    }

    /// Consume one metrics sample and update both cells.
    pub fn record_sample(&self, sample: NetworkMetrics) -> ConnectionQuality {
        let (quality, preset) = {
            let mut inner = self.inner.lock();
            inner.window.push_back(sample);
            if inner.window.len() > WINDOW_CAPACITY {
                inner.window.pop_front();
            }

            let avg = average(&inner.window);
            let quality = classify(&avg);
            debug!(
                "quality window: rtt={:.0}ms loss={:.1}% bw={:.0}bps jitter={:.1}ms -> {}",
                avg.rtt_ms,
                avg.packet_loss * 100.0,
                avg.bandwidth_bps,
                avg.jitter_ms,
                quality.as_str()
            );

            let before = inner.preset;
            match quality {
                ConnectionQuality::Poor => {
                    inner.consecutive_poor += 1;
                    if inner.consecutive_poor >= POOR_STREAK_LIMIT {
                        inner.preset = before.step_down();
                        inner.consecutive_poor = 0;
                    }
                }
                ConnectionQuality::Fair => {
                    if before > QualityPreset::Medium {
                        inner.preset = before.step_down();
                    }
                    inner.consecutive_poor = 0;
                }
                ConnectionQuality::Good => {
                    if before == QualityPreset::Low {
                        inner.preset = before.step_up();
                    }
                    inner.consecutive_poor = 0;
                }
                ConnectionQuality::Excellent => {
                    if avg.bandwidth_bps > ULTRA_BANDWIDTH_BPS {
                        inner.preset = QualityPreset::Ultra;
                    } else if before < QualityPreset::High {
                        inner.preset = before.step_up();
                    }
                    inner.consecutive_poor = 0;
                }
            }

            if inner.preset != before {
                debug!("recommended preset: {:?} -> {:?}", before, inner.preset);
            }
            (quality, inner.preset)
        };

        self.quality_tx.send_if_modified(|current| {
            if *current != quality {
                *current = quality;
                true
            } else {
                false
            }
        });
        let config = preset.video_config(self.codec);
        self.config_tx.send_if_modified(|current| {
            if *current != config {
                *current = config;
                true
            } else {
                false
            }
        });
        quality
    }

    /// Clear the window and revert to the GOOD/MEDIUM defaults. Called when
    /// a session ends, not when metrics merely stop arriving.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.window.clear();
            inner.consecutive_poor = 0;
            inner.preset = QualityPreset::Medium;
        }
        self.quality_tx.send_if_modified(|current| {
            if *current != ConnectionQuality::Good {
                *current = ConnectionQuality::Good;
                true
            } else {
                false
            }
        });
        let config = QualityPreset::Medium.video_config(self.codec);
        self.config_tx.send_if_modified(|current| {
            if *current != config {
                *current = config;
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality_tx.subscribe()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<VideoConfig> {
        self.config_tx.subscribe()
    }

    pub fn current_quality(&self) -> ConnectionQuality {
        *self.quality_tx.borrow()
    }

    pub fn recommended_config(&self) -> VideoConfig {
        *self.config_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rtt_ms: f64, packet_loss: f64, bandwidth_bps: f64) -> NetworkMetrics {
        NetworkMetrics {
            rtt_ms,
            packet_loss,
            bandwidth_bps,
            jitter_ms: 5.0,
            timestamp: 0,
        }
    }

    fn preset_of(monitor: &QualityMonitor) -> VideoConfig {
        monitor.recommended_config()
    }

    #[test]
    fn defaults_are_good_and_medium() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        assert_eq!(monitor.current_quality(), ConnectionQuality::Good);
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn short_poor_streak_keeps_config() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        let medium = QualityPreset::Medium.video_config(VideoCodec::H264);

        assert_eq!(
            monitor.record_sample(sample(400.0, 0.15, 500_000.0)),
            ConnectionQuality::Poor
        );
        assert_eq!(preset_of(&monitor), medium);
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        assert_eq!(preset_of(&monitor), medium);
    }

    #[test]
    fn three_consecutive_poor_samples_step_down() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Low.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn excellent_with_bandwidth_jumps_to_ultra() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        let quality = monitor.record_sample(sample(20.0, 0.001, 4_000_000.0));
        assert_eq!(quality, ConnectionQuality::Excellent);
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Ultra.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn excellent_without_bandwidth_steps_to_high() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        monitor.record_sample(sample(20.0, 0.001, 2_000_000.0));
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::High.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn fair_steps_down_only_above_medium() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        // Climb to HIGH, then degrade the window until the mean lands in FAIR.
        monitor.record_sample(sample(20.0, 0.001, 2_000_000.0));
        let quality = monitor.record_sample(sample(400.0, 0.09, 1_000_000.0));
        assert_eq!(quality, ConnectionQuality::Fair);
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );

        // FAIR at MEDIUM holds position.
        monitor.record_sample(sample(250.0, 0.06, 1_000_000.0));
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn thresholds_are_conjunctive() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        // Excellent latency but heavy loss must classify POOR, not EXCELLENT.
        let quality = monitor.record_sample(sample(30.0, 0.20, 5_000_000.0));
        assert_eq!(quality, ConnectionQuality::Poor);
    }

    #[test]
    fn reset_restores_defaults_and_counter() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        monitor.reset();
        assert_eq!(monitor.current_quality(), ConnectionQuality::Good);
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );

        // The poor streak does not survive a reset.
        monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Medium.video_config(VideoCodec::H264)
        );
    }

    #[test]
    fn window_eviction_lets_quality_recover() {
        let monitor = QualityMonitor::new(VideoCodec::H264);
        for _ in 0..WINDOW_CAPACITY {
            monitor.record_sample(sample(400.0, 0.15, 500_000.0));
        }
        assert_eq!(monitor.current_quality(), ConnectionQuality::Poor);
        for _ in 0..WINDOW_CAPACITY {
            monitor.record_sample(sample(10.0, 0.0, 4_000_000.0));
        }
        assert_eq!(monitor.current_quality(), ConnectionQuality::Excellent);
        assert_eq!(
            preset_of(&monitor),
            QualityPreset::Ultra.video_config(VideoCodec::H264)
        );
    }
}
