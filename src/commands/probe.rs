use anyhow::{Context, Result};
use clap::Args;

use crate::config::BridgeConfig;
use crate::device::{self, DeviceConfig};

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// ALSA PCM name, a path to a kernel audio region, or "gadget"
    #[arg(short, long)]
    pub device: String,

    /// Probe the playback side instead of capture
    #[arg(long)]
    pub playback: bool,
}

/// Open the device off-line, report what it negotiated, and close it again.
pub fn execute(args: ProbeArgs) -> Result<()> {
    let knobs = BridgeConfig::load().unwrap_or_default();
    let config = DeviceConfig {
        device_id: args.device.clone(),
        playback: args.playback,
        buffer_size: 128,
        sample_rate: 48000,
    };

    let backend = device::open_backend(&config, &knobs)
        .with_context(|| format!("Failed to open {}", args.device))?;
    let hw = backend.hw_config();

    println!("device:        {}", args.device);
    println!(
        "direction:     {}",
        if args.playback { "playback" } else { "capture" }
    );
    println!(
        "back-end:      {}",
        if backend.is_sync() {
            "synchronous shared-memory"
        } else {
            "asynchronous PCM"
        }
    );
    println!("format:        {}", hw.format.name());
    println!("channels:      {}", hw.num_channels);
    println!("sample rate:   {} Hz", hw.sample_rate);
    println!("period:        {} frames", hw.period_size);
    println!("periods:       {}", hw.num_periods);
    println!("device buffer: {} frames", hw.full_buffer_size);

    Ok(())
}
