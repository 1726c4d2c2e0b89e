use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::audio::resampler::{MAX_RESAMPLE_QUALITY, MIN_RESAMPLE_QUALITY};

/// Bridge tuning knobs.
///
/// Every field has a sensible default; a config file only needs the values
/// it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host-block multiples kept queued in the capture ring buffer.
    #[serde(default = "default_ringbuffer_blocks")]
    pub capture_ringbuffer_blocks: u32,

    /// Host-block multiples kept queued in the playback ring buffer.
    #[serde(default = "default_ringbuffer_blocks")]
    pub playback_ringbuffer_blocks: u32,

    /// Seconds of audio before clock-drift ratios are computed.
    #[serde(default = "default_drift_delay_1")]
    pub clock_drift_wait_delay_1: u32,

    /// Seconds of audio before dynamic resampling is engaged.
    #[serde(default = "default_drift_delay_2")]
    pub clock_drift_wait_delay_2: u32,

    /// Short smoothing constant of the drift filter.
    #[serde(default = "default_filter_steps_1")]
    pub clock_filter_steps_1: u32,

    /// Long smoothing constant of the drift filter.
    #[serde(default = "default_filter_steps_2")]
    pub clock_filter_steps_2: u32,

    /// Target device period size in frames.
    #[serde(default = "default_device_buffer_size")]
    pub device_buffer_size: u32,

    /// Resampler half-length, 8..96.
    #[serde(default = "default_resample_quality")]
    pub resample_quality: u32,

    /// SCHED_FIFO priority of the capture device worker.
    #[serde(default = "default_capture_priority")]
    pub capture_thread_priority: i32,

    /// SCHED_FIFO priority of the playback device worker.
    #[serde(default = "default_playback_priority")]
    pub playback_thread_priority: i32,
}

fn default_ringbuffer_blocks() -> u32 {
    4
}

fn default_drift_delay_1() -> u32 {
    2
}

fn default_drift_delay_2() -> u32 {
    10
}

fn default_filter_steps_1() -> u32 {
    1024
}

fn default_filter_steps_2() -> u32 {
    8192
}

fn default_device_buffer_size() -> u32 {
    16
}

fn default_resample_quality() -> u32 {
    8
}

fn default_capture_priority() -> i32 {
    71
}

fn default_playback_priority() -> i32 {
    70
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capture_ringbuffer_blocks: default_ringbuffer_blocks(),
            playback_ringbuffer_blocks: default_ringbuffer_blocks(),
            clock_drift_wait_delay_1: default_drift_delay_1(),
            clock_drift_wait_delay_2: default_drift_delay_2(),
            clock_filter_steps_1: default_filter_steps_1(),
            clock_filter_steps_2: default_filter_steps_2(),
            device_buffer_size: default_device_buffer_size(),
            resample_quality: default_resample_quality(),
            capture_thread_priority: default_capture_priority(),
            playback_thread_priority: default_playback_priority(),
        }
    }
}

impl BridgeConfig {
    /// Config file path: `~/.config/sndbridge/config.toml`.
    pub fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("sndbridge").join("config.toml"))
    }

    /// Load from file, or defaults when none exists.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;

        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config.sanitized())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Clamp out-of-range values instead of refusing the file.
    pub fn sanitized(mut self) -> Self {
        self.capture_ringbuffer_blocks = self.capture_ringbuffer_blocks.max(1);
        self.playback_ringbuffer_blocks = self.playback_ringbuffer_blocks.max(1);
        self.clock_filter_steps_1 = self.clock_filter_steps_1.max(1);
        self.clock_filter_steps_2 = self.clock_filter_steps_2.max(1);
        self.device_buffer_size = self.device_buffer_size.clamp(8, 8192);
        self.resample_quality = self
            .resample_quality
            .clamp(MIN_RESAMPLE_QUALITY, MAX_RESAMPLE_QUALITY);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_match_tuning() {
        let config = BridgeConfig::default();
        assert_eq!(config.capture_ringbuffer_blocks, 4);
        assert_eq!(config.playback_ringbuffer_blocks, 4);
        assert_eq!(config.clock_drift_wait_delay_1, 2);
        assert_eq!(config.clock_drift_wait_delay_2, 10);
        assert_eq!(config.clock_filter_steps_1, 1024);
        assert_eq!(config.clock_filter_steps_2, 8192);
        assert_eq!(config.device_buffer_size, 16);
        assert_eq!(config.resample_quality, 8);
        assert_eq!(config.capture_thread_priority, 71);
        assert_eq!(config.playback_thread_priority, 70);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: BridgeConfig = toml::from_str("device_buffer_size = 64").unwrap();
        assert_eq!(config.device_buffer_size, 64);
        assert_eq!(config.resample_quality, 8);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let mut config = BridgeConfig::default();
        config.resample_quality = 32;
        config.capture_ringbuffer_blocks = 16;

        let serialized = toml::to_string(&config).unwrap();
        let deserialized: BridgeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.resample_quality, 32);
        assert_eq!(deserialized.capture_ringbuffer_blocks, 16);
    }

    #[test]
    fn sanitize_clamps_extremes() {
        let config: BridgeConfig =
            toml::from_str("resample_quality = 4000\ncapture_ringbuffer_blocks = 0").unwrap();
        let config = config.sanitized();
        assert_eq!(config.resample_quality, MAX_RESAMPLE_QUALITY);
        assert_eq!(config.capture_ringbuffer_blocks, 1);
    }
}
