use std::ffi::c_void;
use std::ptr::NonNull;

/// Deinterleaved multichannel f32 ring buffer.
///
/// Single producer, single consumer, power-of-two capacity with one slot kept
/// free to tell full from empty. The buffer itself carries no locks; when the
/// two sides live on different threads the callers wrap `read`/`write` in a
/// short external mutex (the bridge holds it for one memcpy per channel).
///
/// Channel payloads are pinned into physical RAM after allocation so the
/// audio threads never fault on them.
pub struct AudioRingBuffer {
    bufs: Vec<Vec<f32>>,
    samples: u32,
    head: u32,
    tail: u32,
    locked_pages: bool,
    error_reading: bool,
    error_writing: bool,
}

impl AudioRingBuffer {
    /// Create a buffer holding at least `min_samples` frames per channel.
    ///
    /// The capacity is rounded up to the next power of two.
    pub fn new(channels: usize, min_samples: u32) -> Self {
        assert!(channels > 0, "ring buffer needs at least one channel");
        assert!(min_samples > 0, "ring buffer needs a non-zero size");

        let samples = min_samples.next_power_of_two();
        let mut bufs: Vec<Vec<f32>> = (0..channels)
            .map(|_| vec![0.0f32; samples as usize])
            .collect();

        let mut locked_pages = true;
        for buf in bufs.iter_mut() {
            let len = buf.len() * std::mem::size_of::<f32>();
            match NonNull::new(buf.as_mut_ptr() as *mut c_void) {
                Some(ptr) if unsafe { nix::sys::mman::mlock(ptr, len) }.is_ok() => {}
                _ => locked_pages = false,
            }
        }
        if !locked_pages {
            tracing::warn!(
                "could not lock {} ring buffer pages into RAM",
                channels * samples as usize
            );
        }

        Self {
            bufs,
            samples,
            head: 0,
            tail: 0,
            locked_pages,
            error_reading: false,
            error_writing: false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.samples
    }

    pub fn channels(&self) -> usize {
        self.bufs.len()
    }

    pub fn readable(&self) -> u32 {
        let wrap = if self.head >= self.tail { 0 } else { self.samples };
        wrap + self.head - self.tail
    }

    pub fn writable(&self) -> u32 {
        let wrap = if self.tail > self.head { 0 } else { self.samples };
        wrap + self.tail - self.head - 1
    }

    /// Reset read and write positions, marking the buffer empty.
    ///
    /// Only legal while neither side is mid `read`/`write`; the bridge calls
    /// this under the same mutex it uses for the data operations.
    pub fn flush(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.error_writing = false;
    }

    /// Copy `frames` frames into `outs[c][offset..]` per channel.
    ///
    /// Fails without moving the tail when the buffer holds fewer than
    /// `frames` frames. An empty buffer always fails, even for zero frames.
    pub fn read<O: AsMut<[f32]>>(&mut self, outs: &mut [O], frames: u32, offset: usize) -> bool {
        if self.head == self.tail {
            return false;
        }

        let head = self.head;
        let tail = self.tail;
        let wrap = if head > tail { 0 } else { self.samples };

        if frames > wrap + head - tail {
            if !self.error_reading {
                self.error_reading = true;
                tracing::warn!(
                    "ring buffer read of {} frames failed, only {} readable",
                    frames,
                    wrap + head - tail
                );
            }
            return false;
        }

        let frames = frames as usize;
        let tail = tail as usize;
        let samples = self.samples as usize;
        let mut readto = tail + frames;

        if readto > samples {
            readto -= samples;
            let firstpart = samples - tail;
            for (buf, out) in self.bufs.iter().zip(outs.iter_mut()) {
                let out = out.as_mut();
                out[offset..offset + firstpart].copy_from_slice(&buf[tail..]);
                out[offset + firstpart..offset + frames].copy_from_slice(&buf[..readto]);
            }
        } else {
            for (buf, out) in self.bufs.iter().zip(outs.iter_mut()) {
                out.as_mut()[offset..offset + frames]
                    .copy_from_slice(&buf[tail..tail + frames]);
            }
            if readto == samples {
                readto = 0;
            }
        }

        self.tail = readto as u32;
        self.error_reading = false;
        true
    }

    /// Copy `frames` frames from `ins[c]` per channel.
    ///
    /// Fails without moving the head when fewer than `frames` slots are
    /// writable (capacity minus one frame distinguishes full from empty).
    pub fn write<I: AsRef<[f32]>>(&mut self, ins: &[I], frames: u32) -> bool {
        debug_assert!(frames < self.samples, "write of {frames} exceeds capacity");

        let head = self.head;
        let tail = self.tail;
        let wrap = if tail > head { 0 } else { self.samples };

        if frames >= wrap + tail - head {
            if !self.error_writing {
                self.error_writing = true;
                tracing::warn!(
                    "ring buffer write of {} frames failed, only {} writable",
                    frames,
                    wrap + tail - head - 1
                );
            }
            return false;
        }

        let frames = frames as usize;
        let head = head as usize;
        let samples = self.samples as usize;
        let mut writeto = head + frames;

        if writeto > samples {
            writeto -= samples;
            let firstpart = samples - head;
            for (buf, inp) in self.bufs.iter_mut().zip(ins.iter()) {
                let inp = inp.as_ref();
                buf[head..].copy_from_slice(&inp[..firstpart]);
                buf[..writeto].copy_from_slice(&inp[firstpart..frames]);
            }
        } else {
            for (buf, inp) in self.bufs.iter_mut().zip(ins.iter()) {
                buf[head..head + frames].copy_from_slice(&inp.as_ref()[..frames]);
            }
            if writeto == samples {
                writeto = 0;
            }
        }

        self.head = writeto as u32;
        self.error_writing = false;
        true
    }
}

impl Drop for AudioRingBuffer {
    fn drop(&mut self) {
        if !self.locked_pages {
            return;
        }
        for buf in self.bufs.iter_mut() {
            let len = buf.len() * std::mem::size_of::<f32>();
            if let Some(ptr) = NonNull::new(buf.as_mut_ptr() as *mut c_void) {
                let _ = unsafe { nix::sys::mman::munlock(ptr, len) };
            }
        }
    }
}
