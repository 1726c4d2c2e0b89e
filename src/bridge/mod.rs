pub mod device;
pub mod stats;
pub mod supervisor;

use std::sync::Arc;

pub use device::BridgeDevice;
pub use stats::{BridgeMonitor, DriftStats, DriftTuning, MonitorSnapshot, RatioUpdate};
pub use supervisor::Supervisor;

use crate::config::BridgeConfig;
use crate::device::DeviceConfig;
use crate::error::BridgeError;

/// Shell-facing wrapper tying one [`BridgeDevice`] to the [`Supervisor`]
/// that opens and releases it.
///
/// `run` is called from the host audio callback. While a device is attached
/// it drives the orchestrator; when the device reports itself gone the
/// wrapper hands it off for release, keeps the host fed with silence
/// (capture) or drops samples (playback), and paces re-open requests at one
/// per second of audio.
pub struct Bridge {
    device: Option<Box<BridgeDevice>>,
    supervisor: Supervisor,
    playback: bool,
    sample_rate: u32,
    enabled: bool,
    stats_enabled: bool,
    monitor: Arc<BridgeMonitor>,
    frames_until_reopen: u32,
}

impl Bridge {
    pub fn new(
        config: DeviceConfig,
        knobs: BridgeConfig,
        enabled: bool,
        stats_enabled: bool,
    ) -> Result<Self, BridgeError> {
        let playback = config.playback;
        let sample_rate = config.sample_rate;
        let supervisor = Supervisor::spawn(config, knobs, enabled)?;
        supervisor.request_reopen();

        Ok(Self {
            device: None,
            supervisor,
            playback,
            sample_rate,
            enabled,
            stats_enabled,
            monitor: Arc::new(BridgeMonitor::default()),
            frames_until_reopen: sample_rate,
        })
    }

    /// Handle for shells to read state and ratios from any thread.
    pub fn monitor(&self) -> Arc<BridgeMonitor> {
        self.monitor.clone()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if let Some(device) = &self.device {
            device.set_enabled(enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Process one host block; called once per audio callback.
    pub fn run(&mut self, buffers: &mut [Vec<f32>], frames: usize) {
        if self.device.is_none() {
            if let Some(device) = self.supervisor.try_take() {
                device.set_enabled(self.enabled);
                tracing::debug!(
                    "bridge attached {} ({} channels at {} Hz)",
                    device.device_config().device_id,
                    device.hw_config().num_channels,
                    device.hw_config().sample_rate
                );
                self.device = Some(device);
                self.frames_until_reopen = self.sample_rate;
            }
        }

        if let Some(device) = self.device.as_mut() {
            if device.run(buffers, frames) {
                device.publish(&self.monitor, self.stats_enabled);
                return;
            }
            tracing::debug!("bridge device gone, scheduling re-open");
            if let Some(dead) = self.device.take() {
                self.supervisor.release(dead);
            }
            self.frames_until_reopen = self.sample_rate;
        }

        // deviceless: feed silence on capture, drop playback samples
        if !self.playback {
            for ch in buffers.iter_mut() {
                let n = frames.min(ch.len());
                ch[..n].fill(0.0);
            }
        }
        self.monitor.clear();

        self.frames_until_reopen = self.frames_until_reopen.saturating_sub(frames as u32);
        if self.frames_until_reopen == 0 {
            self.frames_until_reopen = self.sample_rate;
            self.supervisor.request_reopen();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bogus_config() -> DeviceConfig {
        DeviceConfig {
            device_id: "sndbridge-no-such-device".to_string(),
            playback: false,
            buffer_size: 64,
            sample_rate: 48000,
        }
    }

    #[test]
    fn deviceless_bridge_outputs_silence_and_paces_reopen() {
        let mut bridge =
            Bridge::new(bogus_config(), BridgeConfig::default(), true, true).unwrap();

        let mut buffers = vec![vec![0.8f32; 64]; 2];
        // a bit over one second of audio so at least one re-open attempt
        // gets scheduled and fails quietly
        for _ in 0..800 {
            bridge.run(&mut buffers, 64);
            assert!(buffers[0].iter().all(|v| *v == 0.0));
        }
        assert!(!bridge.has_device());

        let snap = bridge.monitor().snapshot();
        assert_eq!(snap.state, 0);
        assert_eq!(snap.num_channels, 0);
    }

    #[test]
    fn enable_toggle_survives_devicelessness() {
        let mut bridge =
            Bridge::new(bogus_config(), BridgeConfig::default(), true, false).unwrap();
        bridge.set_enabled(false);
        assert!(!bridge.is_enabled());
        bridge.set_enabled(true);
        assert!(bridge.is_enabled());
    }
}
