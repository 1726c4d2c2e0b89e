use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::audio::clamp_ratio;
use crate::config::BridgeConfig;
use crate::device::HardwareConfig;

/// Unit of stored audio used by the fill-level arithmetic: the ring level is
/// measured in chunks of this many frames, and the fill target is expressed
/// in the same unit. Both divisions must share this constant.
pub const RING_BUFFER_DATA_FACTOR: f64 = 32.0;

/// Update suppression threshold for the filtered ratio.
const RATIO_EPSILON: f64 = 2e-9;

/// Drift filter tuning, copied out of the configuration at init.
#[derive(Debug, Clone, Copy)]
pub struct DriftTuning {
    /// Seconds of audio before the ratio is computed at all.
    pub wait_delay_1: u32,
    /// Seconds of audio before the ratio is pushed into the resampler.
    pub wait_delay_2: u32,
    /// Short smoothing constant (inner filter).
    pub filter_steps_1: u32,
    /// Long smoothing constant (outer filter).
    pub filter_steps_2: u32,
}

impl DriftTuning {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            wait_delay_1: config.clock_drift_wait_delay_1,
            wait_delay_2: config.clock_drift_wait_delay_2,
            filter_steps_1: config.clock_filter_steps_1.max(1),
            filter_steps_2: config.clock_filter_steps_2.max(1),
        }
    }
}

/// Clock-drift measurement for the asynchronous data path.
///
/// The ring buffer occupancy is the only observable: a device running fast
/// fills it above the target, a slow one drains it. The occupancy error is
/// folded through two exponential filters into `rb_ratio`, the factor the
/// resampler applies on top of its nominal rate ratio.
pub struct DriftStats {
    frames_done: u32,
    fill_target: f64,
    rb_ratio: f64,
}

/// Outcome of one drift update.
pub enum RatioUpdate {
    /// Warm-up or suppressed change; nothing to apply.
    Hold,
    /// Filtered ratio moved but is still in its observation window.
    Observed,
    /// Filtered ratio should be pushed into the resampler.
    Apply(f64),
}

impl DriftStats {
    pub fn new(num_buffering_samples: u32) -> Self {
        Self {
            frames_done: 0,
            fill_target: num_buffering_samples as f64 / RING_BUFFER_DATA_FACTOR,
            rb_ratio: 1.0,
        }
    }

    pub fn reset(&mut self) {
        self.frames_done = 0;
        self.rb_ratio = 1.0;
    }

    pub fn accumulate(&mut self, frames: u32) {
        self.frames_done = self.frames_done.saturating_add(frames);
    }

    pub fn frames_done(&self) -> u32 {
        self.frames_done
    }

    pub fn fill_target(&self) -> f64 {
        self.fill_target
    }

    pub fn rb_ratio(&self) -> f64 {
        self.rb_ratio
    }

    /// Ring occupancy expressed as a ratio of the fill target, clamped the
    /// way the observability surface reports it.
    pub fn instant_ratio(&self, readable: u32) -> f64 {
        clamp_ratio(readable as f64 / RING_BUFFER_DATA_FACTOR / self.fill_target)
    }

    /// Fold one cycle's ring occupancy into the filtered ratio.
    pub fn update(&mut self, readable: u32, tuning: &DriftTuning, sample_rate: u32) -> RatioUpdate {
        if self.frames_done <= sample_rate.saturating_mul(tuning.wait_delay_1) {
            return RatioUpdate::Hold;
        }

        let f1 = tuning.filter_steps_1 as f64;
        let instantaneous = 2.0
            - ((readable as f64 / RING_BUFFER_DATA_FACTOR / self.fill_target) + f1 - 1.0) / f1;

        let f2 = tuning.filter_steps_2 as f64;
        let filtered = ((instantaneous + self.rb_ratio * (f2 - 1.0)) / f2).clamp(0.9, 1.1);

        if (self.rb_ratio - filtered).abs() <= RATIO_EPSILON {
            return RatioUpdate::Hold;
        }
        self.rb_ratio = filtered;

        if self.frames_done > sample_rate.saturating_mul(tuning.wait_delay_2) {
            RatioUpdate::Apply(filtered)
        } else {
            RatioUpdate::Observed
        }
    }
}

/// Observability snapshot published from the audio thread, all atomics so
/// the shell can read it from anywhere without touching the audio path.
#[derive(Default)]
pub struct BridgeMonitor {
    /// 0 = no device, otherwise `DeviceState as u8 + 1` (1..=5).
    state: AtomicU8,
    num_channels: AtomicU32,
    num_periods: AtomicU32,
    period_size: AtomicU32,
    full_buffer_size: AtomicU32,
    ratio_active: AtomicU64,
    ratio_filtered: AtomicU64,
}

/// Plain-data view of [`BridgeMonitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSnapshot {
    pub state: u8,
    pub num_channels: u32,
    pub num_periods: u32,
    pub period_size: u32,
    pub full_buffer_size: u32,
    pub ratio_active: f64,
    pub ratio_filtered: f64,
}

impl BridgeMonitor {
    pub fn publish_geometry(&self, hw: &HardwareConfig) {
        self.num_channels
            .store(hw.num_channels as u32, Ordering::Relaxed);
        self.num_periods.store(hw.num_periods, Ordering::Relaxed);
        self.period_size.store(hw.period_size, Ordering::Relaxed);
        self.full_buffer_size
            .store(hw.full_buffer_size, Ordering::Relaxed);
    }

    pub fn publish_state(&self, state: u8) {
        self.state.store(state, Ordering::Relaxed);
    }

    pub fn publish_ratios(&self, active: f64, filtered: f64) {
        self.ratio_active.store(active.to_bits(), Ordering::Relaxed);
        self.ratio_filtered
            .store(filtered.to_bits(), Ordering::Relaxed);
    }

    /// Zero everything; the shell shows this while no device is attached.
    pub fn clear(&self) {
        self.state.store(0, Ordering::Relaxed);
        self.num_channels.store(0, Ordering::Relaxed);
        self.num_periods.store(0, Ordering::Relaxed);
        self.period_size.store(0, Ordering::Relaxed);
        self.full_buffer_size.store(0, Ordering::Relaxed);
        self.publish_ratios(0.0, 0.0);
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            state: self.state.load(Ordering::Relaxed),
            num_channels: self.num_channels.load(Ordering::Relaxed),
            num_periods: self.num_periods.load(Ordering::Relaxed),
            period_size: self.period_size.load(Ordering::Relaxed),
            full_buffer_size: self.full_buffer_size.load(Ordering::Relaxed),
            ratio_active: f64::from_bits(self.ratio_active.load(Ordering::Relaxed)),
            ratio_filtered: f64::from_bits(self.ratio_filtered.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> DriftTuning {
        DriftTuning {
            wait_delay_1: 2,
            wait_delay_2: 10,
            filter_steps_1: 1024,
            filter_steps_2: 8192,
        }
    }

    #[test]
    fn holds_during_warmup() {
        let mut stats = DriftStats::new(512);
        stats.accumulate(48000); // one second, below the two second gate
        assert!(matches!(
            stats.update(512, &tuning(), 48000),
            RatioUpdate::Hold
        ));
        assert_eq!(stats.rb_ratio(), 1.0);
    }

    #[test]
    fn converges_to_unity_at_target_fill() {
        let num_buffering = 2048u32;
        let mut stats = DriftStats::new(num_buffering);
        let t = tuning();

        // past both warm-up gates
        stats.accumulate(48000 * 11);

        for _ in 0..t.filter_steps_2 {
            stats.update(num_buffering, &t, 48000);
        }
        assert!(
            (stats.rb_ratio() - 1.0).abs() < 1e-4,
            "rb_ratio {}",
            stats.rb_ratio()
        );
    }

    #[test]
    fn low_fill_pushes_ratio_up() {
        // a ring running below target means the device clock is slow
        // relative to the host; the resampler has to stretch
        let num_buffering = 2048u32;
        let mut stats = DriftStats::new(num_buffering);
        let t = tuning();
        stats.accumulate(48000 * 11);

        for _ in 0..t.filter_steps_2 {
            stats.update(num_buffering / 2, &t, 48000);
        }
        assert!(stats.rb_ratio() > 1.0, "rb_ratio {}", stats.rb_ratio());
        assert!(stats.rb_ratio() <= 1.1);
    }

    #[test]
    fn filtered_ratio_is_clamped() {
        let mut stats = DriftStats::new(32);
        let t = tuning();
        stats.accumulate(48000 * 11);

        // absurd overfill cannot push the ratio below the clamp
        for _ in 0..100_000 {
            stats.update(32 * 400, &t, 48000);
        }
        assert!(stats.rb_ratio() >= 0.9);
    }

    #[test]
    fn apply_only_after_second_gate() {
        let mut stats = DriftStats::new(2048);
        let t = tuning();

        stats.accumulate(48000 * 3); // past gate one, not gate two
        match stats.update(512, &t, 48000) {
            RatioUpdate::Observed => {}
            _ => panic!("expected Observed between the gates"),
        }

        stats.accumulate(48000 * 8); // past gate two
        match stats.update(512, &t, 48000) {
            RatioUpdate::Apply(r) => assert!(r > 1.0),
            _ => panic!("expected Apply after the gates"),
        }
    }

    #[test]
    fn tiny_changes_are_suppressed() {
        let mut stats = DriftStats::new(2048);
        let t = tuning();
        stats.accumulate(48000 * 11);

        // drive to equilibrium, then feed the exact same level: the next
        // update must not report a change
        for _ in 0..(t.filter_steps_2 * 4) {
            stats.update(2048, &t, 48000);
        }
        assert!(matches!(
            stats.update(2048, &t, 48000),
            RatioUpdate::Hold
        ));
    }

    #[test]
    fn monitor_roundtrips_values() {
        let monitor = BridgeMonitor::default();
        monitor.publish_state(5);
        monitor.publish_ratios(1.0884, 1.0002);
        let snap = monitor.snapshot();
        assert_eq!(snap.state, 5);
        assert!((snap.ratio_active - 1.0884).abs() < 1e-12);
        assert!((snap.ratio_filtered - 1.0002).abs() < 1e-12);

        monitor.clear();
        let snap = monitor.snapshot();
        assert_eq!(snap.state, 0);
        assert_eq!(snap.ratio_filtered, 0.0);
    }
}
