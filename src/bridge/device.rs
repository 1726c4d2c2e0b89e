use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::{AudioRingBuffer, GainSmoother, RatioResampler};
use crate::bridge::stats::{BridgeMonitor, DriftStats, DriftTuning, RatioUpdate};
use crate::config::BridgeConfig;
use crate::device::{
    self, DeviceBackend, DeviceConfig, DeviceState, HardwareConfig, ProcessShared, ResetRequest,
};
use crate::error::BridgeError;

/// How many times a starved ring read is retried (with yields in between)
/// before the cycle falls back to silence.
const READ_RETRIES: u32 = 5;

/// Host-side orchestrator for one bridged device.
///
/// `run` is driven from the host audio callback with one block per cycle.
/// It never blocks beyond the short ring mutex, never allocates, and always
/// fills the caller's buffers on the capture direction (silence when the
/// data path is down). The return value is the back-end's liveness: `false`
/// means the device is gone and the shell should release this orchestrator
/// off the audio thread and schedule a re-open.
pub struct BridgeDevice {
    config: DeviceConfig,
    hw: HardwareConfig,
    backend: Box<dyn DeviceBackend>,
    proc: Option<Arc<ProcessShared>>,
    resampler: Option<RatioResampler>,
    scratch: Vec<Vec<f32>>,
    silence: Vec<Vec<f32>>,
    leftover: usize,
    stats: DriftStats,
    tuning: DriftTuning,
    enabled: AtomicBool,
    gain: GainSmoother,
    last_ok: bool,
    last_readable: u32,
}

/// Time constant of the mute/unmute gain ramp.
const GAIN_RAMP_MS: f32 = 20.0;

fn reset_path_state(
    resampler: &mut RatioResampler,
    stats: &mut DriftStats,
    leftover: &mut usize,
    scratch: &mut [Vec<f32>],
) {
    stats.reset();
    *leftover = 0;
    resampler.reset();
    for ch in scratch.iter_mut() {
        ch.fill(0.0);
    }
}

impl BridgeDevice {
    /// Open the device named by `config` and set up the data path for it.
    pub fn init(
        config: DeviceConfig,
        knobs: &BridgeConfig,
        enabled: bool,
    ) -> Result<Self, BridgeError> {
        let backend = device::open_backend(&config, knobs)?;
        Self::with_backend(config, knobs, backend, enabled)
    }

    fn with_backend(
        config: DeviceConfig,
        knobs: &BridgeConfig,
        mut backend: Box<dyn DeviceBackend>,
        enabled: bool,
    ) -> Result<Self, BridgeError> {
        let hw = *backend.hw_config();
        let channels = hw.num_channels;
        let block = config.buffer_size as usize;

        let mut proc = None;
        let mut resampler = None;
        let mut num_buffering = 1;

        if !backend.is_sync() {
            let blocks = if config.playback {
                knobs.playback_ringbuffer_blocks
            } else {
                knobs.capture_ringbuffer_blocks
            }
            .max(1);
            num_buffering = (config.buffer_size as u32).max(hw.full_buffer_size) * blocks;

            let ring =
                AudioRingBuffer::new(channels, config.sample_rate.max(hw.sample_rate));
            let shared = Arc::new(ProcessShared::new(ring, num_buffering));
            backend.attach(shared.clone())?;

            // each direction resamples along its own data path: capture
            // converts device-rate to host-rate, playback the reverse
            let nominal = if config.playback {
                hw.sample_rate as f64 / config.sample_rate as f64
            } else {
                config.sample_rate as f64 / hw.sample_rate as f64
            };
            resampler = Some(RatioResampler::new(
                nominal,
                channels,
                knobs.resample_quality,
            )?);
            proc = Some(shared);
        }

        let stats = DriftStats::new(num_buffering);
        tracing::debug!("ring fill target is {} chunks", stats.fill_target());

        let gain = GainSmoother::new(
            if enabled { 1.0 } else { 0.0 },
            config.sample_rate,
            GAIN_RAMP_MS,
        );

        Ok(Self {
            config,
            hw,
            backend,
            proc,
            resampler,
            scratch: vec![vec![0.0; block * 4]; channels],
            silence: vec![vec![0.0; block]; channels],
            leftover: 0,
            stats,
            tuning: DriftTuning::from_config(knobs),
            enabled: AtomicBool::new(enabled),
            gain,
            last_ok: false,
            last_readable: 0,
        })
    }

    pub fn hw_config(&self) -> &HardwareConfig {
        &self.hw
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Process one host block. Capture fills `buffers[..channels]`, playback
    /// consumes them. Returns the device liveness.
    pub fn run(&mut self, buffers: &mut [Vec<f32>], frames: usize) -> bool {
        let channels = self.hw.num_channels;
        debug_assert!(buffers.len() >= channels);

        if frames > self.config.buffer_size as usize {
            if self.last_ok {
                tracing::warn!(
                    "host block of {} exceeds configured {}, dropping cycle",
                    frames,
                    self.config.buffer_size
                );
                self.last_ok = false;
            }
            if !self.config.playback {
                zero_buffers(buffers, channels, frames);
            }
            return self.backend.post(frames);
        }

        let enabled = self.enabled.load(Ordering::Relaxed);
        self.gain
            .set_target(if enabled { 1.0 } else { 0.0 });

        if self.backend.is_sync() {
            if self.config.playback {
                if self.gain.settled_at(1.0) {
                    self.backend.run_playback_sync(buffers, frames);
                } else {
                    // ramped copy so mute transitions stay click-free
                    scale_into(&mut self.gain, buffers, &mut self.silence, channels, frames);
                    self.backend.run_playback_sync(&mut self.silence, frames);
                }
            } else {
                let ok = self.backend.run_capture_sync(buffers, frames);
                if ok {
                    apply_gain(&mut self.gain, buffers, channels, frames);
                } else {
                    zero_buffers(buffers, channels, frames);
                }
            }
            return self.backend.post(frames);
        }

        self.run_async(buffers, frames)
    }

    fn run_async(&mut self, buffers: &mut [Vec<f32>], frames: usize) -> bool {
        let playback = self.config.playback;
        let sample_rate = self.config.sample_rate;
        let channels = self.hw.num_channels;

        let BridgeDevice {
            proc: Some(proc),
            resampler: Some(resampler),
            scratch,
            stats,
            leftover,
            tuning,
            backend,
            gain,
            last_ok,
            last_readable,
            ..
        } = self
        else {
            return true;
        };

        match proc.consume_reset() {
            ResetRequest::Full => {
                if let Ok(mut ring) = proc.ring.lock() {
                    ring.flush();
                }
                reset_path_state(resampler, stats, leftover, scratch);
            }
            ResetRequest::StatsOnly => {
                reset_path_state(resampler, stats, leftover, scratch);
            }
            ResetRequest::None => {}
        }

        let state = proc.state();
        let mut ok = false;

        if playback {
            if state == DeviceState::Started {
                proc.set_state(DeviceState::Buffering);
            } else if state >= DeviceState::Buffering {
                let out_space = scratch[0].len();
                let status =
                    resampler.process(&buffers[..channels], frames, scratch, 0, out_space);
                debug_assert_eq!(status.consumed, frames);
                apply_gain(gain, scratch, channels, status.produced);

                ok = match proc.ring.lock() {
                    Ok(mut ring) => ring.write(&scratch[..], status.produced as u32),
                    Err(_) => false,
                };
            }
        } else {
            if state == DeviceState::Started {
                proc.set_state(DeviceState::Buffering);
            } else if state == DeviceState::Running {
                let mut offset = 0usize;
                let mut pending = (*leftover).min(frames);

                while offset != frames {
                    let remaining = frames - offset;
                    pending = pending.min(remaining);

                    let mut got = false;
                    for _ in 0..READ_RETRIES {
                        got = match proc.ring.lock() {
                            Ok(mut ring) => {
                                ring.read(scratch, (remaining - pending) as u32, pending)
                            }
                            Err(_) => false,
                        };
                        if got {
                            break;
                        }
                        std::thread::yield_now();
                    }
                    if !got {
                        pending = 0;
                        ok = false;
                        break;
                    }
                    ok = true;

                    let status = resampler.process(
                        &scratch[..],
                        remaining,
                        &mut buffers[..channels],
                        offset,
                        remaining,
                    );
                    if status.produced == 0 && status.consumed == 0 {
                        // resampler refused to move; bail out to silence
                        // rather than spin on the audio thread
                        pending = 0;
                        ok = false;
                        break;
                    }

                    offset += status.produced;
                    pending = remaining - status.consumed;
                    if pending > 0 && status.consumed > 0 {
                        for ch in scratch.iter_mut() {
                            ch.copy_within(status.consumed..remaining, 0);
                        }
                    }
                }
                *leftover = pending;
            }

            if ok {
                apply_gain(gain, buffers, channels, frames);
            } else {
                zero_buffers(buffers, channels, frames);
            }
        }

        if ok != *last_ok {
            tracing::debug!("bridge data path {}", if ok { "flowing" } else { "stalled" });
            *last_ok = ok;
        }

        if ok {
            stats.accumulate(frames as u32);
            if state == DeviceState::Running {
                let readable = match proc.ring.lock() {
                    Ok(ring) => ring.readable(),
                    Err(_) => 0,
                };
                *last_readable = readable;
                if let RatioUpdate::Apply(ratio) = stats.update(readable, tuning, sample_rate) {
                    resampler.set_rratio(ratio);
                }
            }
        } else {
            if state == DeviceState::Running {
                proc.set_state(DeviceState::Starting);
                if let Ok(mut ring) = proc.ring.lock() {
                    ring.flush();
                }
            }
            reset_path_state(resampler, stats, leftover, scratch);
        }

        backend.post(frames)
    }

    /// Export the observability surface for this cycle.
    pub fn publish(&self, monitor: &BridgeMonitor, stats_enabled: bool) {
        monitor.publish_geometry(&self.hw);
        let state_code = match &self.proc {
            Some(proc) => proc.state() as u8 + 1,
            // the synchronous path has no pre-roll; it is running or gone
            None => DeviceState::Running as u8 + 1,
        };
        monitor.publish_state(state_code);

        if !stats_enabled {
            monitor.publish_ratios(0.0, 0.0);
            return;
        }
        match &self.resampler {
            Some(resampler) => {
                let active = self.stats.instant_ratio(self.last_readable);
                let filtered = resampler.nominal_ratio() * self.stats.rb_ratio();
                monitor.publish_ratios(active, filtered);
            }
            None => monitor.publish_ratios(1.0, 1.0),
        }
    }
}

fn zero_buffers(buffers: &mut [Vec<f32>], channels: usize, frames: usize) {
    for ch in buffers.iter_mut().take(channels) {
        let n = frames.min(ch.len());
        ch[..n].fill(0.0);
    }
}

/// Ramp the mute gain across one block in place. Settled gains take the
/// cheap paths: pass-through at unity, memset at zero.
fn apply_gain(gain: &mut GainSmoother, buffers: &mut [Vec<f32>], channels: usize, frames: usize) {
    if gain.settled_at(1.0) {
        return;
    }
    if gain.settled_at(0.0) {
        zero_buffers(buffers, channels, frames);
        return;
    }
    for i in 0..frames {
        let g = gain.next();
        for ch in buffers.iter_mut().take(channels) {
            ch[i] *= g;
        }
    }
}

/// Ramped copy of one block, for paths that must not modify the source.
fn scale_into(
    gain: &mut GainSmoother,
    src: &[Vec<f32>],
    dst: &mut [Vec<f32>],
    channels: usize,
    frames: usize,
) {
    if gain.settled_at(0.0) {
        zero_buffers(dst, channels, frames);
        return;
    }
    for i in 0..frames {
        let g = gain.next();
        for (s, d) in src.iter().zip(dst.iter_mut()).take(channels) {
            d[i] = s[i] * g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;
    use std::sync::Mutex;

    const HOST_BLOCK: usize = 64;
    const HOST_RATE: u32 = 48000;

    #[derive(Default)]
    struct FakeHooks {
        proc: Mutex<Option<Arc<ProcessShared>>>,
        alive: AtomicBool,
    }

    struct FakeBackend {
        hw: HardwareConfig,
        hooks: Arc<FakeHooks>,
    }

    impl DeviceBackend for FakeBackend {
        fn hw_config(&self) -> &HardwareConfig {
            &self.hw
        }

        fn attach(&mut self, proc: Arc<ProcessShared>) -> Result<(), BridgeError> {
            *self.hooks.proc.lock().unwrap() = Some(proc);
            Ok(())
        }

        fn post(&mut self, _frames: usize) -> bool {
            self.hooks.alive.load(Ordering::Relaxed)
        }
    }

    fn fake_device(playback: bool) -> (BridgeDevice, Arc<FakeHooks>, Arc<ProcessShared>) {
        let hooks = Arc::new(FakeHooks::default());
        hooks.alive.store(true, Ordering::Relaxed);

        let hw = HardwareConfig {
            format: SampleFormat::S32,
            num_channels: 2,
            num_periods: 4,
            period_size: 32,
            full_buffer_size: 128,
            sample_rate: HOST_RATE,
        };
        let config = DeviceConfig {
            device_id: "fake".to_string(),
            playback,
            buffer_size: HOST_BLOCK as u16,
            sample_rate: HOST_RATE,
        };
        let backend = Box::new(FakeBackend {
            hw,
            hooks: hooks.clone(),
        });
        let dev =
            BridgeDevice::with_backend(config, &BridgeConfig::default(), backend, true).unwrap();
        let proc = hooks.proc.lock().unwrap().clone().unwrap();
        (dev, hooks, proc)
    }

    fn host_buffers(fill: f32) -> Vec<Vec<f32>> {
        vec![vec![fill; HOST_BLOCK]; 2]
    }

    fn feed_ring(proc: &ProcessShared, value: f32, frames: u32) {
        let data = vec![vec![value; frames as usize]; 2];
        assert!(proc.ring.lock().unwrap().write(&data, frames));
    }

    #[test]
    fn capture_outputs_silence_before_running() {
        let (mut dev, _hooks, proc) = fake_device(false);
        let mut buffers = host_buffers(0.7);

        assert!(dev.run(&mut buffers, HOST_BLOCK));
        assert!(buffers[0].iter().all(|v| *v == 0.0));
        assert_eq!(proc.state(), DeviceState::Initializing);
    }

    #[test]
    fn host_side_advances_started_to_buffering() {
        let (mut dev, _hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Started);

        let mut buffers = host_buffers(0.0);
        assert!(dev.run(&mut buffers, HOST_BLOCK));
        assert_eq!(proc.state(), DeviceState::Buffering);
    }

    #[test]
    fn capture_delivers_ring_data_when_running() {
        let (mut dev, _hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Running);

        let mut buffers = host_buffers(0.0);
        let mut peak = 0.0f32;
        for _ in 0..50 {
            // keep the ring topped up the way the worker would
            let readable = proc.ring.lock().unwrap().readable();
            if readable < 4 * HOST_BLOCK as u32 {
                feed_ring(&proc, 0.5, 4 * HOST_BLOCK as u32);
            }
            assert!(dev.run(&mut buffers, HOST_BLOCK));
            peak = peak.max(buffers[0].iter().fold(0.0f32, |m, v| m.max(*v)));
        }
        assert!(
            (peak - 0.5).abs() < 0.05,
            "ring data never reached the host, peak {peak}"
        );
        assert_eq!(proc.state(), DeviceState::Running);
    }

    #[test]
    fn capture_underrun_zeroes_and_restarts() {
        let (mut dev, _hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Running);

        // ring left empty: one failing cycle must zero the output and fall
        // back to Starting with a flushed ring
        let mut buffers = host_buffers(0.9);
        assert!(dev.run(&mut buffers, HOST_BLOCK), "device is still alive");
        assert!(buffers[0].iter().all(|v| *v == 0.0));
        assert!(buffers[1].iter().all(|v| *v == 0.0));
        assert_eq!(proc.state(), DeviceState::Starting);
        assert_eq!(proc.ring.lock().unwrap().readable(), 0);
    }

    #[test]
    fn full_reset_flushes_ring() {
        let (mut dev, _hooks, proc) = fake_device(false);
        feed_ring(&proc, 0.1, 256);
        proc.request_reset(ResetRequest::Full);

        let mut buffers = host_buffers(0.0);
        assert!(dev.run(&mut buffers, HOST_BLOCK));
        assert_eq!(proc.ring.lock().unwrap().readable(), 0);
        assert_eq!(proc.consume_reset(), ResetRequest::None);
    }

    #[test]
    fn dead_backend_reports_gone_within_one_cycle() {
        let (mut dev, hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Running);
        hooks.alive.store(false, Ordering::Relaxed);

        let mut buffers = host_buffers(0.0);
        assert!(!dev.run(&mut buffers, HOST_BLOCK));
    }

    #[test]
    fn playback_fills_ring_when_buffering() {
        let (mut dev, _hooks, proc) = fake_device(true);
        proc.set_state(DeviceState::Started);

        let mut buffers = host_buffers(0.25);
        assert!(dev.run(&mut buffers, HOST_BLOCK)); // Started -> Buffering
        assert_eq!(proc.state(), DeviceState::Buffering);

        for _ in 0..8 {
            assert!(dev.run(&mut buffers, HOST_BLOCK));
        }
        let readable = proc.ring.lock().unwrap().readable();
        assert!(readable > 0, "playback never queued data");
    }

    #[test]
    fn disabled_capture_ramps_to_silence_but_keeps_draining() {
        let (mut dev, _hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Running);
        dev.set_enabled(false);

        let mut buffers = host_buffers(0.3);
        let mut peaks = Vec::new();
        let mut drained = 0u32;
        for _ in 0..200 {
            let readable = proc.ring.lock().unwrap().readable();
            if readable < 4 * HOST_BLOCK as u32 {
                let add = 4 * HOST_BLOCK as u32;
                feed_ring(&proc, 0.5, add);
                drained = drained.wrapping_add(add);
            }
            assert!(dev.run(&mut buffers, HOST_BLOCK));
            peaks.push(buffers[0].iter().fold(0.0f32, |m, v| m.max(v.abs())));
        }

        // the mute ramps down instead of cutting, then reaches true zero
        assert!(peaks.last().copied().unwrap() == 0.0, "mute never settled");
        assert!(
            peaks.iter().any(|p| *p > 0.0 && *p < 0.4),
            "no ramp observed: {:?}",
            &peaks[..8]
        );
        assert!(drained > 0, "disabled capture must keep draining the ring");
    }

    #[test]
    fn publish_reports_state_and_geometry() {
        let (mut dev, _hooks, proc) = fake_device(false);
        proc.set_state(DeviceState::Running);

        let monitor = BridgeMonitor::default();
        feed_ring(&proc, 0.0, 8 * HOST_BLOCK as u32);
        let mut buffers = host_buffers(0.0);
        dev.run(&mut buffers, HOST_BLOCK);
        dev.publish(&monitor, true);

        let snap = monitor.snapshot();
        assert_eq!(snap.state, DeviceState::Running as u8 + 1);
        assert_eq!(snap.num_channels, 2);
        assert_eq!(snap.period_size, 32);
        assert!(snap.ratio_filtered > 0.0);
    }

    #[test]
    fn oversized_host_block_degrades_to_silence() {
        let (mut dev, _hooks, _proc) = fake_device(false);
        let mut buffers = vec![vec![0.4f32; HOST_BLOCK * 4]; 2];
        assert!(dev.run(&mut buffers, HOST_BLOCK * 4));
        assert!(buffers[0].iter().all(|v| *v == 0.0));
    }
}
