use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::device::DeviceConfig;

/// Widest channel layout a bridged device may expose.
const MAX_CHANNELS: usize = 32;

/// Global flag for signal-triggered shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    /// Device to host: the bridged device feeds the system output.
    Capture,
    /// Host to device: the system input feeds the bridged device.
    Playback,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// ALSA PCM name, a path to a kernel audio region, or "gadget"
    #[arg(short, long, default_value = "default")]
    pub device: String,

    /// Bridge direction relative to the device
    #[arg(long, value_enum, default_value_t = Direction::Capture)]
    pub direction: Direction,

    /// Host block size in frames
    #[arg(short, long, default_value_t = 128)]
    pub block_size: u16,

    /// Start with the bridge muted
    #[arg(long)]
    pub muted: bool,

    /// Skip the clock-ratio statistics readout
    #[arg(long)]
    pub no_stats: bool,
}

pub fn execute(args: RunArgs) -> Result<()> {
    let knobs = BridgeConfig::load().unwrap_or_default();
    let playback = args.direction == Direction::Playback;
    let block = args.block_size.max(16) as usize;

    ctrlc::set_handler(|| {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    })
    .ok();

    // the system audio device stands in for the host graph: captured
    // audio plays out of it, playback audio comes from its input
    let host = cpal::default_host();
    let (host_device, host_config) = if playback {
        let device = host
            .default_input_device()
            .context("No default input device available")?;
        let config = device
            .default_input_config()
            .context("Failed to get default input config")?;
        (device, config)
    } else {
        let device = host
            .default_output_device()
            .context("No default output device available")?;
        let config = device
            .default_output_config()
            .context("Failed to get default output config")?;
        (device, config)
    };

    if host_config.sample_format() != cpal::SampleFormat::F32 {
        anyhow::bail!(
            "host device speaks {:?}, only f32 streams are supported",
            host_config.sample_format()
        );
    }

    let host_channels = host_config.channels() as usize;
    let host_rate = host_config.sample_rate().0;

    tracing::info!(
        "host side: {} channels at {} Hz, {} frame blocks",
        host_channels,
        host_rate,
        block
    );

    let device_config = DeviceConfig {
        device_id: args.device.clone(),
        playback,
        buffer_size: block as u16,
        sample_rate: host_rate,
    };

    let buffer_size = match host_config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max }
            if (block as u32) >= *min && (block as u32) <= *max =>
        {
            BufferSize::Fixed(block as u32)
        }
        _ => {
            tracing::warn!(
                "host device cannot fix {} frame blocks, using its default size",
                block
            );
            BufferSize::Default
        }
    };

    let bridge = Bridge::new(device_config, knobs, !args.muted, !args.no_stats)
        .context("Failed to start bridge")?;
    let monitor = bridge.monitor();

    let stream = build_stream(
        &host_device,
        host_channels,
        host_rate,
        block,
        buffer_size,
        playback,
        bridge,
    )?;
    stream.play().context("Failed to start host audio stream")?;

    println!(
        "bridging {} ({}) <-> system {}; ctrl-c to stop",
        args.device,
        if playback { "playback" } else { "capture" },
        if playback { "input" } else { "output" },
    );

    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        let snap = monitor.snapshot();
        println!(
            "state {:9} | {} ch | {} x {} frames | ratio {:.6} (fill {:.3})",
            state_name(snap.state),
            snap.num_channels,
            snap.num_periods,
            snap.period_size,
            snap.ratio_filtered,
            snap.ratio_active,
        );
    }

    drop(stream);
    Ok(())
}

fn state_name(code: u8) -> &'static str {
    match code {
        0 => "no-device",
        1 => "init",
        2 => "starting",
        3 => "started",
        4 => "buffering",
        _ => "running",
    }
}

fn build_stream(
    device: &cpal::Device,
    host_channels: usize,
    host_rate: u32,
    block: usize,
    buffer_size: BufferSize,
    playback: bool,
    mut bridge: Bridge,
) -> Result<cpal::Stream> {
    let err_fn = |err| {
        tracing::error!("host audio stream error: {}", err);
    };

    let config = StreamConfig {
        channels: host_channels as u16,
        sample_rate: SampleRate(host_rate),
        buffer_size,
    };

    // planar scratch between the interleaved host stream and the bridge
    let mut planar: Vec<Vec<f32>> = vec![vec![0.0; block]; MAX_CHANNELS];

    let stream = if playback {
        device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let frames = data.len() / host_channels;
                    let mut done = 0;
                    while done < frames {
                        let n = (frames - done).min(block);
                        for (ch, plane) in planar.iter_mut().enumerate() {
                            if ch < host_channels {
                                for i in 0..n {
                                    plane[i] = data[(done + i) * host_channels + ch];
                                }
                            } else {
                                plane[..n].fill(0.0);
                            }
                        }
                        bridge.run(&mut planar, n);
                        done += n;
                    }
                },
                err_fn,
                None,
            )
            .context("Failed to build input stream")?
    } else {
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / host_channels;
                    let mut done = 0;
                    while done < frames {
                        let n = (frames - done).min(block);
                        bridge.run(&mut planar, n);
                        for i in 0..n {
                            for ch in 0..host_channels {
                                data[(done + i) * host_channels + ch] =
                                    planar.get(ch).map_or(0.0, |p| p[i]);
                            }
                        }
                        done += n;
                    }
                },
                err_fn,
                None,
            )
            .context("Failed to build output stream")?
    };

    Ok(stream)
}
