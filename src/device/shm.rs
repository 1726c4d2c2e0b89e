use std::fs::OpenOptions;
use std::io::Read;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::audio::format::{self, SampleFormat};
use crate::config::BridgeConfig;
use crate::device::{DeviceBackend, DeviceConfig, HardwareConfig};
use crate::error::BridgeError;

/// Kernel gadget region nodes, one per direction.
pub const DEFAULT_CAPTURE_PATH: &str = "/proc/uac2c";
pub const DEFAULT_PLAYBACK_PATH: &str = "/proc/uac2p";

/// Region header layout (native byte order, 4-byte aligned):
///
/// ```text
/// u8  active_kernel
/// u8  active_userspace
/// u8  data_size          // bytes per sample: 2 | 3 | 4
/// u8  num_channels
/// u32 sample_rate
/// u32 buffer_size        // payload bytes
/// u32 bufpos_kernel      // atomic
/// u32 bufpos_userspace   // atomic
/// i32 extra_ppm          // userspace writes, kernel reads
/// u8  buffer[buffer_size]
/// ```
const HEADER_SIZE: usize = 24;
const OFF_ACTIVE_KERNEL: usize = 0;
const OFF_ACTIVE_USERSPACE: usize = 1;
const OFF_DATA_SIZE: usize = 2;
const OFF_NUM_CHANNELS: usize = 3;
const OFF_SAMPLE_RATE: usize = 4;
const OFF_BUFFER_SIZE: usize = 8;
const OFF_BUFPOS_KERNEL: usize = 12;
const OFF_BUFPOS_USERSPACE: usize = 16;
const OFF_EXTRA_PPM: usize = 20;

/// Distance history length for the PPM average (one second at 48 kHz / 32
/// frame blocks).
const NUM_PPMS: usize = 48000 / 32;

/// Weight of the userspace hint and its clamp window.
const PPM_FACTOR: i32 = 8;
const PPM_LIMIT: i32 = 100;

fn load_u32(map: &MmapMut, off: usize, order: Ordering) -> u32 {
    unsafe { &*(map.as_ptr().add(off) as *const AtomicU32) }.load(order)
}

fn store_u32(map: &MmapMut, off: usize, v: u32, order: Ordering) {
    unsafe { &*(map.as_ptr().add(off) as *const AtomicU32) }.store(v, order);
}

fn load_i32(map: &MmapMut, off: usize) -> i32 {
    unsafe { &*(map.as_ptr().add(off) as *const AtomicI32) }.load(Ordering::Relaxed)
}

fn store_i32(map: &MmapMut, off: usize, v: i32) {
    unsafe { &*(map.as_ptr().add(off) as *const AtomicI32) }.store(v, Ordering::Relaxed);
}

/// Circular sum of recent block distances, in frames.
struct DistanceHistory {
    sum: i64,
    idx: usize,
    entries: Vec<i32>,
}

impl DistanceHistory {
    fn new() -> Self {
        Self {
            sum: 0,
            idx: 0,
            entries: vec![0; NUM_PPMS],
        }
    }

    fn reset(&mut self, distance: i32) {
        self.entries.fill(distance);
        self.idx = 0;
        self.sum = distance as i64 * NUM_PPMS as i64;
    }

    fn push(&mut self, distance: i32) {
        let idx = self.idx % NUM_PPMS;
        self.idx = self.idx.wrapping_add(1);
        self.sum = self.sum - self.entries[idx] as i64 + distance as i64;
        self.entries[idx] = distance;
    }
}

fn instant_ppm(frames: i32, half_blocks: i32, d_frames: i32, playback: bool) -> i32 {
    let centered = if playback {
        d_frames - frames * half_blocks + frames / 2
    } else {
        frames * half_blocks + frames / 2 - d_frames
    };
    let scaled = centered as f64 / frames as f64 * PPM_FACTOR as f64;
    scaled.clamp(-(PPM_LIMIT as f64), PPM_LIMIT as f64) as i32
}

/// Synchronous back-end over a kernel-exported shared-memory audio region.
///
/// Runs entirely inside the host callback: one block is copied per cycle and
/// a smoothed PPM clock hint is fed back so the kernel can slew its audio
/// clock toward the host. There is no worker thread, no ring buffer and no
/// resampler on this path.
pub struct ShmBackend {
    map: MmapMut,
    hw: HardwareConfig,
    playback: bool,
    expected_rate: u32,
    blocks: u32,
    raw: Vec<u8>,
    started: bool,
    disconnected: bool,
    frame: u32,
    distance: DistanceHistory,
}

impl ShmBackend {
    pub fn open(config: &DeviceConfig, knobs: &BridgeConfig) -> Result<Self, BridgeError> {
        let path = if config.device_id == "gadget" {
            if config.playback {
                DEFAULT_PLAYBACK_PATH.to_string()
            } else {
                DEFAULT_CAPTURE_PATH.to_string()
            }
        } else {
            config.device_id.clone()
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| BridgeError::ShmOpen {
                path: path.clone(),
                source,
            })?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|source| BridgeError::ShmOpen {
                path: path.clone(),
                source,
            })?;

        if header[OFF_ACTIVE_KERNEL] == 0 {
            return Err(BridgeError::ShmInactive { path });
        }

        let data_size = header[OFF_DATA_SIZE];
        let num_channels = header[OFF_NUM_CHANNELS] as usize;
        let sample_rate = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        let buffer_size =
            u32::from_ne_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let format = SampleFormat::from_bytes_per_sample(data_size).ok_or_else(|| {
            BridgeError::ShmGeometry {
                path: path.clone(),
                detail: format!("unsupported sample size {data_size}"),
            }
        })?;
        if num_channels == 0 || num_channels > 32 {
            return Err(BridgeError::ShmGeometry {
                path,
                detail: format!("unsupported channel count {num_channels}"),
            });
        }
        let frame_bytes = num_channels * data_size as usize;
        if buffer_size == 0 || buffer_size % frame_bytes != 0 {
            return Err(BridgeError::ShmGeometry {
                path,
                detail: format!("payload of {buffer_size} bytes not a multiple of {frame_bytes}"),
            });
        }

        let map = unsafe {
            MmapOptions::new()
                .len(HEADER_SIZE + buffer_size)
                .map_mut(&file)
        }
        .map_err(|source| BridgeError::ShmOpen {
            path: path.clone(),
            source,
        })?;

        let hw = HardwareConfig {
            format,
            num_channels,
            num_periods: 1,
            period_size: (buffer_size / frame_bytes) as u32,
            full_buffer_size: (buffer_size / frame_bytes) as u32,
            sample_rate,
        };

        let blocks = if config.playback {
            knobs.playback_ringbuffer_blocks
        } else {
            knobs.capture_ringbuffer_blocks
        }
        .max(2);

        let raw_len = buffer_size.max(frame_bytes * config.buffer_size as usize);

        let mut backend = Self {
            map,
            hw,
            playback: config.playback,
            expected_rate: config.sample_rate,
            blocks,
            raw: vec![0u8; raw_len],
            started: false,
            disconnected: false,
            frame: 0,
            distance: DistanceHistory::new(),
        };

        backend.map[OFF_ACTIVE_USERSPACE] = 1;
        store_u32(&backend.map, OFF_BUFPOS_USERSPACE, 0, Ordering::Release);
        store_u32(&backend.map, OFF_BUFPOS_KERNEL, 0, Ordering::Release);

        tracing::info!(
            "opened shared audio region {}: {} channels, {} Hz, {} {} frames",
            path,
            num_channels,
            sample_rate,
            hw.period_size,
            format.name()
        );

        Ok(backend)
    }

    fn region_alive(&mut self) -> bool {
        if self.map[OFF_ACTIVE_KERNEL] == 0 {
            tracing::warn!("{:010} | kernel side of audio region gone", self.frame);
            self.disconnected = true;
            return false;
        }
        let rate = load_u32(&self.map, OFF_SAMPLE_RATE, Ordering::Relaxed);
        if rate != self.expected_rate {
            tracing::warn!(
                "{:010} | audio region sample rate changed {} -> {}",
                self.frame,
                self.expected_rate,
                rate
            );
            self.disconnected = true;
            return false;
        }
        true
    }

    fn update_ppm(&mut self, frames: usize, d_frames: i32) {
        self.distance.push(d_frames);
        let half = (self.blocks / 2) as i32;
        let ppm = instant_ppm(frames as i32, half, d_frames, self.playback);
        let smoothed = (load_i32(&self.map, OFF_EXTRA_PPM) * 3 + ppm) / 4;
        store_i32(&self.map, OFF_EXTRA_PPM, smoothed);
    }
}

impl DeviceBackend for ShmBackend {
    fn hw_config(&self) -> &HardwareConfig {
        &self.hw
    }

    fn is_sync(&self) -> bool {
        true
    }

    fn run_capture_sync(&mut self, buffers: &mut [Vec<f32>], frames: usize) -> bool {
        if !self.region_alive() {
            return false;
        }

        let channels = self.hw.num_channels;
        let frame_bytes = channels * self.hw.format.bytes_per_sample();
        let buffer_size = (self.hw.full_buffer_size as usize * frame_bytes) as i64;
        let n_bytes = (frames * frame_bytes) as i64;
        let half = (self.blocks / 2) as i64;

        if !self.started {
            // first cycle: place our cursor behind the kernel's and report
            // no data yet
            self.started = true;
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.map[OFF_ACTIVE_USERSPACE] = 2;

            let kernel = load_u32(&self.map, OFF_BUFPOS_KERNEL, Ordering::Acquire) as i64;
            let userspace = (kernel - n_bytes * (half - 1)).rem_euclid(buffer_size);
            store_u32(&self.map, OFF_BUFPOS_USERSPACE, userspace as u32, Ordering::Release);

            let distance = ((kernel - userspace).rem_euclid(buffer_size) / frame_bytes as i64) as i32;
            self.distance.reset(distance);
            tracing::debug!(
                "{:010} | capture region running, starting distance {}",
                self.frame,
                distance
            );
            return false;
        }

        let kernel = load_u32(&self.map, OFF_BUFPOS_KERNEL, Ordering::Acquire) as i64;
        let mut userspace = load_u32(&self.map, OFF_BUFPOS_USERSPACE, Ordering::Relaxed) as i64;
        let mut distance = (kernel - userspace).rem_euclid(buffer_size);

        if distance < n_bytes {
            tracing::debug!(
                "{:010} | capture region out of data, {} frames behind",
                self.frame,
                distance / frame_bytes as i64
            );
            distance = n_bytes * half;
            userspace = (kernel - distance).rem_euclid(buffer_size);
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.distance.reset((distance / frame_bytes as i64) as i32);
        } else if distance > n_bytes * self.blocks as i64 {
            tracing::debug!(
                "{:010} | capture region overfull, {} frames ahead",
                self.frame,
                distance / frame_bytes as i64
            );
            distance = n_bytes * half;
            userspace = (kernel - distance).rem_euclid(buffer_size);
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.distance.reset((distance / frame_bytes as i64) as i32);
        }

        {
            let payload = &self.map[HEADER_SIZE..];
            let us = userspace as usize;
            let n = n_bytes as usize;
            let pending = buffer_size as usize - us;
            if pending < n {
                self.raw[..pending].copy_from_slice(&payload[us..us + pending]);
                self.raw[pending..n].copy_from_slice(&payload[..n - pending]);
            } else {
                self.raw[..n].copy_from_slice(&payload[us..us + n]);
            }
        }

        let advanced = ((userspace + n_bytes) % buffer_size) as u32;
        store_u32(&self.map, OFF_BUFPOS_USERSPACE, advanced, Ordering::Release);

        self.update_ppm(frames, (distance / frame_bytes as i64) as i32);

        format::raw_to_float(
            self.hw.format,
            &mut buffers[..channels],
            0,
            &self.raw[..n_bytes as usize],
            frames,
        );
        true
    }

    fn run_playback_sync(&mut self, buffers: &mut [Vec<f32>], frames: usize) -> bool {
        if !self.region_alive() {
            return false;
        }

        let channels = self.hw.num_channels;
        let frame_bytes = channels * self.hw.format.bytes_per_sample();
        let buffer_size = (self.hw.full_buffer_size as usize * frame_bytes) as i64;
        let n_bytes = (frames * frame_bytes) as i64;
        let half = (self.blocks / 2) as i64;

        if !self.started {
            // first cycle: place our cursor ahead of the kernel's and skip
            // this block
            self.started = true;
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.map[OFF_ACTIVE_USERSPACE] = 2;

            let kernel = load_u32(&self.map, OFF_BUFPOS_KERNEL, Ordering::Acquire) as i64;
            let userspace = (kernel + n_bytes * (half + 1)).rem_euclid(buffer_size);
            store_u32(&self.map, OFF_BUFPOS_USERSPACE, userspace as u32, Ordering::Release);

            let distance = ((userspace - kernel).rem_euclid(buffer_size) / frame_bytes as i64) as i32;
            self.distance.reset(distance);
            tracing::debug!(
                "{:010} | playback region running, starting distance {}",
                self.frame,
                distance
            );
            return false;
        }

        format::float_to_raw(
            self.hw.format,
            &mut self.raw[..n_bytes as usize],
            &buffers[..channels],
            frames,
        );

        let kernel = load_u32(&self.map, OFF_BUFPOS_KERNEL, Ordering::Acquire) as i64;
        let mut userspace = load_u32(&self.map, OFF_BUFPOS_USERSPACE, Ordering::Relaxed) as i64;
        let mut distance = (userspace - kernel).rem_euclid(buffer_size);

        if distance < n_bytes {
            tracing::debug!(
                "{:010} | playback region out of data, {} frames ahead",
                self.frame,
                distance / frame_bytes as i64
            );
            distance = n_bytes * half;
            userspace = (kernel + distance).rem_euclid(buffer_size);
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.distance.reset((distance / frame_bytes as i64) as i32);
        } else if distance > n_bytes * self.blocks as i64 {
            tracing::debug!(
                "{:010} | playback region overfull, {} frames ahead",
                self.frame,
                distance / frame_bytes as i64
            );
            distance = n_bytes * half;
            userspace = (kernel + distance).rem_euclid(buffer_size);
            store_i32(&self.map, OFF_EXTRA_PPM, 0);
            self.distance.reset((distance / frame_bytes as i64) as i32);
        }

        {
            let us = userspace as usize;
            let n = n_bytes as usize;
            let pending = buffer_size as usize - us;
            let payload = &mut self.map[HEADER_SIZE..];
            if pending < n {
                payload[us..us + pending].copy_from_slice(&self.raw[..pending]);
                payload[..n - pending].copy_from_slice(&self.raw[pending..n]);
            } else {
                payload[us..us + n].copy_from_slice(&self.raw[..n]);
            }
        }

        let advanced = ((userspace + n_bytes) % buffer_size) as u32;
        store_u32(&self.map, OFF_BUFPOS_USERSPACE, advanced, Ordering::Release);

        self.update_ppm(frames, (distance / frame_bytes as i64) as i32);
        true
    }

    fn post(&mut self, frames: usize) -> bool {
        self.frame = self.frame.wrapping_add(frames as u32);
        !self.disconnected
    }
}

impl Drop for ShmBackend {
    fn drop(&mut self) {
        self.map[OFF_ACTIVE_USERSPACE] = 0;
        store_i32(&self.map, OFF_EXTRA_PPM, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    const TEST_CHANNELS: usize = 2;
    const TEST_RATE: u32 = 48000;
    const TEST_BLOCK: usize = 32;

    struct Region {
        path: PathBuf,
        map: MmapMut,
    }

    impl Region {
        fn create(name: &str, data_size: u8, payload_bytes: usize) -> Region {
            let path = std::env::temp_dir().join(format!(
                "sndbridge-shm-{}-{}",
                name,
                std::process::id()
            ));
            let mut header = vec![0u8; HEADER_SIZE];
            header[OFF_ACTIVE_KERNEL] = 1;
            header[OFF_DATA_SIZE] = data_size;
            header[OFF_NUM_CHANNELS] = TEST_CHANNELS as u8;
            header[OFF_SAMPLE_RATE..OFF_SAMPLE_RATE + 4].copy_from_slice(&TEST_RATE.to_ne_bytes());
            header[OFF_BUFFER_SIZE..OFF_BUFFER_SIZE + 4]
                .copy_from_slice(&(payload_bytes as u32).to_ne_bytes());

            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            file.write_all(&header).unwrap();
            file.write_all(&vec![0u8; payload_bytes]).unwrap();
            let map = unsafe { MmapMut::map_mut(&file) }.unwrap();
            Region { path, map }
        }

        fn kernel_pos(&self) -> u32 {
            load_u32(&self.map, OFF_BUFPOS_KERNEL, Ordering::Relaxed)
        }

        fn advance_kernel(&self, bytes: u32, payload_bytes: u32) {
            let next = (self.kernel_pos() + bytes) % payload_bytes;
            store_u32(&self.map, OFF_BUFPOS_KERNEL, next, Ordering::Release);
        }

        fn extra_ppm(&self) -> i32 {
            load_i32(&self.map, OFF_EXTRA_PPM)
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn open_capture(region: &Region) -> ShmBackend {
        let config = DeviceConfig {
            device_id: region.path.to_string_lossy().into_owned(),
            playback: false,
            buffer_size: TEST_BLOCK as u16,
            sample_rate: TEST_RATE,
        };
        ShmBackend::open(&config, &BridgeConfig::default()).unwrap()
    }

    #[test]
    fn instant_ppm_reference_values() {
        // 32-frame blocks, 4 ringbuffer blocks: centered distance is 80
        assert_eq!(instant_ppm(32, 2, 32, false), 12);
        assert_eq!(instant_ppm(32, 2, 80, false), 0);
        assert_eq!(instant_ppm(32, 2, 96, false), -4);

        // playback signs mirror
        assert_eq!(instant_ppm(32, 2, 32, true), -4);
        assert_eq!(instant_ppm(32, 2, 96, true), 12);

        // clamp
        assert_eq!(instant_ppm(32, 2, 32 * 200, false), -PPM_LIMIT);
    }

    #[test]
    fn open_validates_geometry() {
        let frame_bytes = TEST_CHANNELS * 4;
        let region = Region::create("badgeom", 4, frame_bytes * 100 + 1);
        let config = DeviceConfig {
            device_id: region.path.to_string_lossy().into_owned(),
            playback: false,
            buffer_size: TEST_BLOCK as u16,
            sample_rate: TEST_RATE,
        };
        assert!(matches!(
            ShmBackend::open(&config, &BridgeConfig::default()),
            Err(BridgeError::ShmGeometry { .. })
        ));
    }

    #[test]
    fn open_rejects_inactive_kernel() {
        let frame_bytes = TEST_CHANNELS * 4;
        let mut region = Region::create("inactive", 4, frame_bytes * 256);
        region.map[OFF_ACTIVE_KERNEL] = 0;

        let config = DeviceConfig {
            device_id: region.path.to_string_lossy().into_owned(),
            playback: false,
            buffer_size: TEST_BLOCK as u16,
            sample_rate: TEST_RATE,
        };
        assert!(matches!(
            ShmBackend::open(&config, &BridgeConfig::default()),
            Err(BridgeError::ShmInactive { .. })
        ));
    }

    #[test]
    fn capture_tracks_kernel_advancement() {
        // one second of stereo S32 at 48 kHz, kernel advancing one host
        // block per cycle
        let frame_bytes = (TEST_CHANNELS * 4) as u32;
        let payload = TEST_RATE * frame_bytes;
        let region = Region::create("capture", 4, payload as usize);
        let mut backend = open_capture(&region);

        assert_eq!(backend.hw_config().num_channels, TEST_CHANNELS);
        assert_eq!(backend.hw_config().sample_rate, TEST_RATE);
        assert!(backend.is_sync());

        let block_bytes = TEST_BLOCK as u32 * frame_bytes;
        let mut buffers = vec![vec![0.0f32; TEST_BLOCK]; TEST_CHANNELS];
        let cycles = TEST_RATE as usize / TEST_BLOCK;
        let mut delivered = 0usize;

        for cycle in 0..cycles {
            region.advance_kernel(block_bytes, payload);
            if backend.run_capture_sync(&mut buffers, TEST_BLOCK) {
                delivered += TEST_BLOCK;
            } else {
                assert_eq!(cycle, 0, "only the handshake cycle may skip data");
            }
            assert!(backend.post(TEST_BLOCK));
            let ppm = region.extra_ppm();
            assert!((-PPM_LIMIT..=PPM_LIMIT).contains(&ppm), "ppm {ppm}");
        }

        let advanced = cycles * TEST_BLOCK;
        assert!(
            advanced - delivered <= TEST_BLOCK,
            "delivered {delivered} of {advanced}"
        );
    }

    #[test]
    fn capture_decodes_payload_samples() {
        let frame_bytes = (TEST_CHANNELS * 4) as u32;
        let payload = 1024 * frame_bytes;
        let mut region = Region::create("decode", 4, payload as usize);

        // fill the whole payload with a known constant
        let code = (0.25f64 * 2147483647.0).round() as i32;
        for chunk in region.map[HEADER_SIZE..].chunks_exact_mut(4) {
            chunk.copy_from_slice(&code.to_ne_bytes());
        }

        let mut backend = open_capture(&region);
        let mut buffers = vec![vec![0.0f32; TEST_BLOCK]; TEST_CHANNELS];
        let block_bytes = TEST_BLOCK as u32 * frame_bytes;

        region.advance_kernel(block_bytes, payload);
        assert!(!backend.run_capture_sync(&mut buffers, TEST_BLOCK));
        region.advance_kernel(block_bytes, payload);
        assert!(backend.run_capture_sync(&mut buffers, TEST_BLOCK));

        for ch in &buffers {
            for v in ch {
                assert!((v - 0.25).abs() < 1e-6, "sample {v}");
            }
        }
    }

    #[test]
    fn kernel_shutdown_disconnects() {
        let frame_bytes = (TEST_CHANNELS * 4) as u32;
        let payload = 1024 * frame_bytes;
        let region = Region::create("shutdown", 4, payload as usize);
        let mut backend = open_capture(&region);
        let mut buffers = vec![vec![0.0f32; TEST_BLOCK]; TEST_CHANNELS];

        region.advance_kernel(TEST_BLOCK as u32 * frame_bytes, payload);
        assert!(!backend.run_capture_sync(&mut buffers, TEST_BLOCK)); // handshake
        assert!(backend.post(TEST_BLOCK));

        // the backend's own mapping observes the kernel flag drop
        backend.map[OFF_ACTIVE_KERNEL] = 0;
        assert!(!backend.run_capture_sync(&mut buffers, TEST_BLOCK));
        assert!(!backend.post(TEST_BLOCK), "post must report lost liveness");
    }

    #[test]
    fn playback_writes_and_recenters() {
        let frame_bytes = (TEST_CHANNELS * 4) as u32;
        let payload = 1024 * frame_bytes;
        let region = Region::create("playback", 4, payload as usize);

        let config = DeviceConfig {
            device_id: region.path.to_string_lossy().into_owned(),
            playback: true,
            buffer_size: TEST_BLOCK as u16,
            sample_rate: TEST_RATE,
        };
        let mut backend = ShmBackend::open(&config, &BridgeConfig::default()).unwrap();

        let mut buffers = vec![vec![0.5f32; TEST_BLOCK]; TEST_CHANNELS];
        assert!(!backend.run_playback_sync(&mut buffers, TEST_BLOCK)); // handshake

        let block_bytes = TEST_BLOCK as u32 * frame_bytes;
        for _ in 0..8 {
            assert!(backend.run_playback_sync(&mut buffers, TEST_BLOCK));
            region.advance_kernel(block_bytes, payload);
            let ppm = region.extra_ppm();
            assert!((-PPM_LIMIT..=PPM_LIMIT).contains(&ppm), "ppm {ppm}");
        }

        // the written region must carry the encoded samples somewhere
        let code = (0.5f64 * 2147483647.0).round() as i32;
        let found = region.map[HEADER_SIZE..]
            .chunks_exact(4)
            .any(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) == code);
        assert!(found, "payload never received playback samples");
    }
}
