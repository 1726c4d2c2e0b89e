pub mod pcm;
pub mod shm;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::audio::{AudioRingBuffer, SampleFormat};
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Immutable per-device configuration chosen by the host side.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// ALSA PCM name, or a filesystem path to a kernel-exported region.
    pub device_id: String,
    /// Playback carries host audio to the device; capture the reverse.
    pub playback: bool,
    /// Host block size in frames.
    pub buffer_size: u16,
    /// Host sample rate in Hz.
    pub sample_rate: u32,
}

/// Immutable device geometry discovered while opening.
#[derive(Debug, Clone, Copy)]
pub struct HardwareConfig {
    pub format: SampleFormat,
    pub num_channels: usize,
    pub num_periods: u32,
    pub period_size: u32,
    pub full_buffer_size: u32,
    pub sample_rate: u32,
}

/// Start-up and steady-state phases of the asynchronous data path.
///
/// The device worker walks `Initializing → Starting → Started`; the host
/// side advances `Started → Buffering`; the worker completes
/// `Buffering → Running` once enough audio is queued. Failures fall back to
/// `Starting` (device alive, stream restarted) together with a reset
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceState {
    Initializing = 0,
    Starting = 1,
    Started = 2,
    Buffering = 3,
    Running = 4,
}

impl DeviceState {
    pub fn from_u8(v: u8) -> DeviceState {
        match v {
            0 => DeviceState::Initializing,
            1 => DeviceState::Starting,
            2 => DeviceState::Started,
            3 => DeviceState::Buffering,
            _ => DeviceState::Running,
        }
    }
}

/// Reset protocol between the device worker (producer) and the host-side
/// orchestrator (consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetRequest {
    None = 0,
    StatsOnly = 1,
    Full = 2,
}

impl ResetRequest {
    fn from_u8(v: u8) -> ResetRequest {
        match v {
            1 => ResetRequest::StatsOnly,
            2 => ResetRequest::Full,
            _ => ResetRequest::None,
        }
    }
}

/// Data shared between the orchestrator and the asynchronous device worker.
///
/// A plain aggregate owned by the orchestrator; the worker holds an `Arc` to
/// it for its (strictly shorter) lifetime. The ring mutex is only ever held
/// for the duration of one copy per channel.
pub struct ProcessShared {
    pub state: AtomicU8,
    pub reset: AtomicU8,
    pub ring: Mutex<AudioRingBuffer>,
    /// Queued frames required before the stream leaves `Buffering`.
    pub num_buffering_samples: u32,
    /// Monotonic shutdown flag, set by the orchestrator, observed by the
    /// worker at every blocking point.
    pub closing: AtomicBool,
    /// Set by the worker on exit; the post hook reports it as lost liveness.
    pub disconnected: AtomicBool,
}

impl ProcessShared {
    pub fn new(ring: AudioRingBuffer, num_buffering_samples: u32) -> Self {
        Self {
            state: AtomicU8::new(DeviceState::Initializing as u8),
            reset: AtomicU8::new(ResetRequest::None as u8),
            ring: Mutex::new(ring),
            num_buffering_samples,
            closing: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn request_reset(&self, reset: ResetRequest) {
        self.reset.store(reset as u8, Ordering::Release);
    }

    /// Read-and-clear, orchestrator side only.
    pub fn consume_reset(&self) -> ResetRequest {
        ResetRequest::from_u8(
            self.reset
                .swap(ResetRequest::None as u8, Ordering::AcqRel),
        )
    }
}

/// Capability surface of a device back-end behind the orchestrator.
///
/// Asynchronous back-ends exchange audio through [`ProcessShared`] from
/// their own worker thread and leave the `sync` operations returning
/// `false`; synchronous back-ends do all their work inside the host
/// callback and have a trivial `post`.
pub trait DeviceBackend: Send {
    fn hw_config(&self) -> &HardwareConfig;

    fn is_sync(&self) -> bool {
        false
    }

    /// Hand the shared process block to an asynchronous back-end and start
    /// its worker. No-op for synchronous back-ends.
    fn attach(&mut self, _proc: Arc<ProcessShared>) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Move one block device → host inside the host callback.
    fn run_capture_sync(&mut self, _buffers: &mut [Vec<f32>], _frames: usize) -> bool {
        false
    }

    /// Move one block host → device inside the host callback.
    fn run_playback_sync(&mut self, _buffers: &mut [Vec<f32>], _frames: usize) -> bool {
        false
    }

    /// Per-cycle liveness hook; false means the device is gone and the
    /// orchestrator should hand it back for release and re-open.
    fn post(&mut self, frames: usize) -> bool;
}

/// Open the back-end matching the device identifier scheme: a filesystem
/// path selects the synchronous kernel-region back-end, anything else is an
/// ALSA PCM name.
pub fn open_backend(
    config: &DeviceConfig,
    knobs: &BridgeConfig,
) -> Result<Box<dyn DeviceBackend>, BridgeError> {
    if config.device_id.starts_with('/') || config.device_id == "gadget" {
        Ok(Box::new(shm::ShmBackend::open(config, knobs)?))
    } else {
        Ok(Box::new(pcm::PcmBackend::open(config, knobs)?))
    }
}
