use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::audio::format::{self, SampleFormat};
use crate::config::BridgeConfig;
use crate::device::{
    DeviceBackend, DeviceConfig, DeviceState, HardwareConfig, ProcessShared, ResetRequest,
};
use crate::error::BridgeError;

const FORMATS_TO_TRY: &[(Format, SampleFormat)] = &[
    (Format::S32LE, SampleFormat::S32),
    (Format::S243LE, SampleFormat::S24LE3),
    (Format::S24LE, SampleFormat::S24),
    (Format::S16LE, SampleFormat::S16),
];

const RATES_TO_TRY: &[u32] = &[48000, 44100, 96000, 88200];

const NUM_PERIODS_MIN: u32 = 3;
const NUM_PERIODS_MAX: u32 = 12;

/// How long `Starting` may poll for availability before the device is
/// declared dead.
const START_WATCHDOG: Duration = Duration::from_secs(1);

/// Bounded blocking point: short enough that the worker observes `closing`
/// promptly, long enough to sleep through a stalled period.
const WAIT_TIMEOUT_MS: u32 = 100;

/// Asynchronous back-end driving a kernel PCM device from its own
/// real-time worker thread.
///
/// `open` negotiates the hardware configuration in a non-real-time context;
/// `attach` hands over the shared process block and starts the worker. All
/// device I/O happens on the worker, which exchanges float audio with the
/// orchestrator through the shared ring buffer under a short-held mutex.
pub struct PcmBackend {
    hw: HardwareConfig,
    playback: bool,
    priority: i32,
    pcm: Option<PCM>,
    proc: Option<Arc<ProcessShared>>,
    worker: Option<JoinHandle<()>>,
    frame: u32,
}

impl PcmBackend {
    pub fn open(config: &DeviceConfig, knobs: &BridgeConfig) -> Result<Self, BridgeError> {
        let device = config.device_id.clone();
        let cname = CString::new(device.as_str())
            .map_err(|_| BridgeError::InvalidDeviceId(device.clone()))?;
        let direction = if config.playback {
            Direction::Playback
        } else {
            Direction::Capture
        };

        let pcm = PCM::open(&cname, direction, true).map_err(|source| BridgeError::PcmOpen {
            device: device.clone(),
            source,
        })?;

        let period = knobs.device_buffer_size as Frames;

        let (sample_format, rate, channels) = {
            let hwp = HwParams::any(&pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_rate_resample(false)?;

            let mut sample_format = None;
            for (alsa_format, fmt) in FORMATS_TO_TRY {
                if hwp.set_format(*alsa_format).is_ok() {
                    tracing::debug!("{}: using sample format {}", device, fmt.name());
                    sample_format = Some(*fmt);
                    break;
                }
            }
            let sample_format = sample_format
                .ok_or_else(|| BridgeError::NoSupportedFormat { device: device.clone() })?;

            let mut rate = None;
            for r in RATES_TO_TRY {
                if hwp.set_rate(*r, ValueOr::Nearest).is_ok() {
                    tracing::debug!("{}: using sample rate {}", device, r);
                    rate = Some(*r);
                    break;
                }
            }
            let rate =
                rate.ok_or_else(|| BridgeError::NoSupportedRate { device: device.clone() })?;

            let channels = if hwp.set_channels(2).is_ok() {
                2
            } else {
                hwp.get_channels()?
            };

            // capture pins the whole buffer to period * periods; playback
            // only caps it so the device keeps headroom for bursts
            let mut chosen = None;
            for periods in NUM_PERIODS_MIN..=NUM_PERIODS_MAX {
                let wanted = period * periods as Frames;
                let ok = if config.playback {
                    hwp.set_buffer_size_max(wanted * 16).is_ok()
                } else {
                    hwp.set_buffer_size(wanted).is_ok()
                };
                if ok {
                    chosen = Some(periods);
                    break;
                }
            }
            if chosen.is_none() {
                return Err(BridgeError::NoBufferGeometry { device });
            }

            pcm.hw_params(&hwp)?;
            (sample_format, rate, channels)
        };

        let (num_periods, period_size, full_buffer_size) = {
            let hwp = pcm.hw_params_current()?;
            (
                hwp.get_periods()?,
                hwp.get_period_size()?,
                hwp.get_buffer_size()?,
            )
        };

        {
            let swp = pcm.sw_params_current()?;
            swp.set_tstamp_mode(false)?;
            swp.set_avail_min(period_size)?;
            swp.set_start_threshold(0)?;
            swp.set_stop_threshold(swp.get_boundary()?)?;
            pcm.sw_params(&swp)?;
        }

        pcm.prepare()?;

        let hw = HardwareConfig {
            format: sample_format,
            num_channels: channels as usize,
            num_periods,
            period_size: period_size as u32,
            full_buffer_size: full_buffer_size as u32,
            sample_rate: rate,
        };

        tracing::info!(
            "opened PCM {} for {}: {} channels, {} Hz, {} x {} frame periods, {}",
            device,
            if config.playback { "playback" } else { "capture" },
            hw.num_channels,
            hw.sample_rate,
            hw.num_periods,
            hw.period_size,
            hw.format.name()
        );

        Ok(Self {
            hw,
            playback: config.playback,
            priority: if config.playback {
                knobs.playback_thread_priority
            } else {
                knobs.capture_thread_priority
            },
            pcm: Some(pcm),
            proc: None,
            worker: None,
            frame: 0,
        })
    }
}

impl DeviceBackend for PcmBackend {
    fn hw_config(&self) -> &HardwareConfig {
        &self.hw
    }

    fn attach(&mut self, proc: Arc<ProcessShared>) -> Result<(), BridgeError> {
        let Some(pcm) = self.pcm.take() else {
            return Ok(());
        };

        let hw = self.hw;
        let playback = self.playback;
        let priority = self.priority;
        let worker_proc = proc.clone();
        let name = if playback {
            "sndbridge-playback"
        } else {
            "sndbridge-capture"
        };

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if playback {
                    playback_worker(pcm, hw, worker_proc, priority);
                } else {
                    capture_worker(pcm, hw, worker_proc, priority);
                }
            })?;

        self.proc = Some(proc);
        self.worker = Some(handle);
        Ok(())
    }

    fn post(&mut self, frames: usize) -> bool {
        self.frame = self.frame.wrapping_add(frames as u32);
        match &self.proc {
            Some(proc) => !proc.disconnected.load(Ordering::Acquire),
            None => true,
        }
    }
}

impl Drop for PcmBackend {
    fn drop(&mut self) {
        if let Some(proc) = &self.proc {
            proc.closing.store(true, Ordering::Release);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Move the calling thread onto the fixed-priority cooperative scheduler.
fn promote_to_realtime(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    rc == 0
}

fn yield_and_wait(pcm: &PCM) {
    std::thread::yield_now();
    let _ = pcm.wait(Some(WAIT_TIMEOUT_MS));
}

/// In-place stream recovery. EPIPE re-prepares, ESTRPIPE retries resume
/// while the suspend flag is up; anything else is unrecoverable.
fn xrun_recovery(pcm: &PCM, proc: &ProcessShared, errno: i32) -> bool {
    if errno == libc::EPIPE {
        if let Err(e) = pcm.prepare() {
            tracing::warn!("cannot recover from xrun, prepare failed: {}", e);
        }
        true
    } else if errno == libc::ESTRPIPE {
        loop {
            match pcm.resume() {
                Ok(()) => break,
                Err(e) if e.errno() == libc::EAGAIN
                    && !proc.closing.load(Ordering::Acquire) =>
                {
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(_) => {
                    if let Err(e) = pcm.prepare() {
                        tracing::warn!("cannot recover from suspend, prepare failed: {}", e);
                    }
                    break;
                }
            }
        }
        true
    } else {
        false
    }
}

fn capture_worker(pcm: PCM, hw: HardwareConfig, proc: Arc<ProcessShared>, priority: i32) {
    if !promote_to_realtime(priority) {
        tracing::warn!("capture worker running without realtime priority {}", priority);
    }

    let channels = hw.num_channels;
    let period = hw.period_size as usize;
    let frame_bytes = channels * hw.format.bytes_per_sample();
    let num_buffering = proc.num_buffering_samples;
    tracing::debug!(
        "capture worker: {} channels, {} frame periods, {} queued to roll",
        channels,
        period,
        num_buffering
    );

    let mut raw = vec![0u8; period * frame_bytes];
    let mut conv = vec![vec![0.0f32; period]; channels];
    let mut starting_since: Option<Instant> = None;
    let io = pcm.io_bytes();

    while !proc.closing.load(Ordering::Acquire) {
        let mut state = proc.state();

        if state == DeviceState::Initializing {
            // drain whatever the device captured before we were ready
            let mut saw_data = false;
            let err = loop {
                match io.readi(&mut raw) {
                    Ok(0) => break None,
                    Ok(_) => saw_data = true,
                    Err(e) => break Some(e),
                }
            };
            starting_since = None;
            match err {
                Some(e) if e.errno() == libc::EPIPE => {
                    tracing::debug!("capture | pipe error while draining: {}", e);
                    let _ = pcm.prepare();
                    yield_and_wait(&pcm);
                    continue;
                }
                Some(e) if e.errno() != libc::EAGAIN => {
                    tracing::error!("capture | initial read error: {}", e);
                    break;
                }
                _ => {}
            }
            if saw_data {
                tracing::debug!("capture | device drained, Initializing -> Starting");
                state = DeviceState::Starting;
                proc.set_state(state);
                proc.request_reset(ResetRequest::Full);
            } else {
                yield_and_wait(&pcm);
                continue;
            }
        }

        if state == DeviceState::Starting {
            match pcm.avail() {
                Ok(n) if n > 0 => {
                    tracing::debug!("capture | device rolling, Starting -> Started");
                    starting_since = None;
                    state = DeviceState::Started;
                    proc.set_state(state);
                }
                Ok(_) => {
                    let since = *starting_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > START_WATCHDOG {
                        tracing::error!("capture | device never became available");
                        break;
                    }
                    yield_and_wait(&pcm);
                    continue;
                }
                Err(e) if e.errno() == libc::EPIPE => {
                    tracing::debug!("capture | pipe error while starting");
                    let _ = pcm.prepare();
                    yield_and_wait(&pcm);
                    continue;
                }
                Err(e) => {
                    tracing::error!("capture | availability error: {}", e);
                    break;
                }
            }
        }

        let frames = match io.readi(&mut raw) {
            Ok(0) => {
                yield_and_wait(&pcm);
                continue;
            }
            Ok(n) => n,
            Err(e) if e.errno() == libc::EAGAIN => {
                yield_and_wait(&pcm);
                continue;
            }
            Err(e) if e.errno() == libc::EPIPE => {
                let _ = pcm.prepare();
                yield_and_wait(&pcm);
                continue;
            }
            Err(e) => {
                proc.set_state(DeviceState::Starting);
                proc.request_reset(ResetRequest::Full);
                tracing::warn!("capture | read error: {}", e);
                if !xrun_recovery(&pcm, &proc, e.errno()) {
                    tracing::error!("capture | unrecoverable read error: {}", e);
                    break;
                }
                continue;
            }
        };

        if proc.closing.load(Ordering::Acquire) {
            break;
        }

        if state == DeviceState::Started {
            // keep draining until the host side moves us to Buffering
            yield_and_wait(&pcm);
            continue;
        }

        format::raw_to_float(hw.format, &mut conv, 0, &raw, frames);

        let (ok, readable) = match proc.ring.lock() {
            Ok(mut ring) => (ring.write(&conv, frames as u32), ring.readable()),
            Err(_) => (false, 0),
        };

        if ok {
            if state == DeviceState::Buffering && readable >= num_buffering {
                tracing::debug!("capture | {} frames queued, Buffering -> Running", readable);
                proc.set_state(DeviceState::Running);
            }
        } else {
            tracing::debug!("capture | ring overrun, falling back to Starting");
            proc.set_state(DeviceState::Starting);
            proc.request_reset(ResetRequest::Full);
            yield_and_wait(&pcm);
        }
    }

    proc.disconnected.store(true, Ordering::Release);
    tracing::debug!("capture worker exit");
}

fn playback_worker(pcm: PCM, hw: HardwareConfig, proc: Arc<ProcessShared>, priority: i32) {
    if !promote_to_realtime(priority) {
        tracing::warn!("playback worker running without realtime priority {}", priority);
    }

    let channels = hw.num_channels;
    let period = hw.period_size as usize;
    let frame_bytes = channels * hw.format.bytes_per_sample();
    let num_buffering = proc.num_buffering_samples;
    tracing::debug!(
        "playback worker: {} channels, {} frame periods, {} queued to roll",
        channels,
        period,
        num_buffering
    );

    let mut raw = vec![0u8; period * frame_bytes];
    let zeros = vec![0u8; period * frame_bytes];
    let mut conv = vec![vec![0.0f32; period]; channels];
    let mut starting_since: Option<Instant> = None;
    let mut fatal = false;
    let io = pcm.io_bytes();

    while !fatal && !proc.closing.load(Ordering::Acquire) {
        let mut state = proc.state();

        if state == DeviceState::Initializing {
            // prime the device with silence until its buffers are full
            let mut saw_space = false;
            let err = loop {
                match io.writei(&zeros) {
                    Ok(0) => break None,
                    Ok(_) => saw_space = true,
                    Err(e) => break Some(e),
                }
            };
            starting_since = None;
            match err {
                Some(e) if e.errno() != libc::EAGAIN => {
                    tracing::error!("playback | initial write error: {}", e);
                    break;
                }
                _ => {}
            }
            if saw_space {
                tracing::debug!("playback | device primed, Initializing -> Starting");
                state = DeviceState::Starting;
                proc.set_state(state);
                proc.request_reset(ResetRequest::Full);
            } else {
                yield_and_wait(&pcm);
                continue;
            }
        }

        if state == DeviceState::Starting {
            match pcm.avail() {
                Ok(n) if n > 0 => {
                    tracing::debug!("playback | device rolling, Starting -> Started");
                    starting_since = None;
                    state = DeviceState::Started;
                    proc.set_state(state);
                }
                Ok(_) => {
                    let since = *starting_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > START_WATCHDOG {
                        tracing::error!("playback | device never became available");
                        break;
                    }
                    yield_and_wait(&pcm);
                    continue;
                }
                Err(e) if e.errno() == libc::EPIPE => {
                    tracing::debug!("playback | pipe error while starting");
                    let _ = pcm.prepare();
                    yield_and_wait(&pcm);
                    continue;
                }
                Err(e) => {
                    tracing::error!("playback | availability error: {}", e);
                    break;
                }
            }
        }

        if state == DeviceState::Started {
            // hold the device at silence until the host side is ready
            let _ = io.writei(&zeros);
            yield_and_wait(&pcm);
            continue;
        }

        if state == DeviceState::Buffering {
            let readable = match proc.ring.lock() {
                Ok(ring) => ring.readable(),
                Err(_) => 0,
            };
            if readable < num_buffering {
                let _ = io.writei(&zeros);
                yield_and_wait(&pcm);
                continue;
            }
            tracing::debug!("playback | {} frames queued, Buffering -> Running", readable);
            proc.set_state(DeviceState::Running);
        }

        let ok = match proc.ring.lock() {
            Ok(mut ring) => ring.read(&mut conv, period as u32, 0),
            Err(_) => false,
        };

        if !ok {
            // the host stopped feeding us; rebuffer with fresh drift stats
            proc.set_state(DeviceState::Buffering);
            proc.request_reset(ResetRequest::StatsOnly);
            let _ = io.writei(&zeros);
            yield_and_wait(&pcm);
            continue;
        }

        if proc.closing.load(Ordering::Acquire) {
            break;
        }

        format::float_to_raw(hw.format, &mut raw, &conv, period);

        let mut done = 0usize;
        while !proc.closing.load(Ordering::Acquire) && done < period {
            match io.writei(&raw[done * frame_bytes..period * frame_bytes]) {
                Ok(0) => yield_and_wait(&pcm),
                Ok(n) if done + n < period => {
                    tracing::debug!("playback | short write {} of {}", n, period - done);
                    done += n;
                    std::thread::yield_now();
                }
                Ok(_) => break,
                Err(e) if e.errno() == libc::EAGAIN => yield_and_wait(&pcm),
                Err(e) => {
                    proc.set_state(DeviceState::Starting);
                    proc.request_reset(ResetRequest::Full);
                    tracing::warn!("playback | write error: {}", e);
                    if !xrun_recovery(&pcm, &proc, e.errno()) {
                        tracing::error!("playback | unrecoverable write error: {}", e);
                        fatal = true;
                    }
                    break;
                }
            }
        }
    }

    proc.disconnected.store(true, Ordering::Release);
    tracing::debug!("playback worker exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_preference_order() {
        let order: Vec<SampleFormat> = FORMATS_TO_TRY.iter().map(|(_, f)| *f).collect();
        assert_eq!(
            order,
            vec![
                SampleFormat::S32,
                SampleFormat::S24LE3,
                SampleFormat::S24,
                SampleFormat::S16
            ]
        );
        assert_eq!(RATES_TO_TRY, &[48000, 44100, 96000, 88200]);
    }

    #[test]
    fn open_rejects_bogus_device() {
        let config = DeviceConfig {
            device_id: "sndbridge-no-such-device".to_string(),
            playback: false,
            buffer_size: 128,
            sample_rate: 48000,
        };
        assert!(PcmBackend::open(&config, &BridgeConfig::default()).is_err());
    }
}
