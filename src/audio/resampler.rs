use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::BridgeError;

/// Resampler half-length quality window, matching the device tuning range.
pub const MIN_RESAMPLE_QUALITY: u32 = 8;
pub const MAX_RESAMPLE_QUALITY: u32 = 96;

/// Frames fed to the inner resampler per pass. Small so the added latency
/// stays under a device period.
const CHUNK_FRAMES: usize = 32;

/// Clamp window for the running ratio adjustment.
pub fn clamp_ratio(ratio: f64) -> f64 {
    ratio.clamp(0.0, 4.0)
}

/// What one `process` call moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    /// Input frames taken from the caller.
    pub consumed: usize,
    /// Output frames delivered to the caller.
    pub produced: usize,
}

/// Streaming wrapper around a variable-ratio polyphase sinc resampler.
///
/// The inner resampler wants fixed-size input chunks; this wrapper stages
/// arbitrary input and output amounts around it so callers can feed host
/// blocks and drain device blocks (or the reverse) without caring about the
/// chunk size. Frames the caller offered but the wrapper could not take yet
/// are reported back through [`ProcessStatus::consumed`] and stay the
/// caller's responsibility.
///
/// All buffers are allocated up front; `process` performs no allocation.
pub struct RatioResampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    nominal_ratio: f64,
    rratio: f64,
    chunk: Vec<Vec<f32>>,
    chunk_filled: usize,
    staged: Vec<Vec<f32>>,
    staged_pos: usize,
    staged_len: usize,
}

impl RatioResampler {
    /// `ratio` is the nominal output/input rate factor; `quality` maps to the
    /// sinc half-length (8..96).
    pub fn new(ratio: f64, channels: usize, quality: u32) -> Result<Self, BridgeError> {
        let quality = quality.clamp(MIN_RESAMPLE_QUALITY, MAX_RESAMPLE_QUALITY);
        let params = SincInterpolationParameters {
            sinc_len: quality as usize * 32,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        // relative headroom of 8 keeps the full [0.25, 4] adjustment window
        // strictly inside what the inner resampler accepts
        let inner = SincFixedIn::<f32>::new(ratio, 8.0, params, CHUNK_FRAMES, channels)
            .map_err(|e| BridgeError::Resampler(e.to_string()))?;

        let staged_max = inner.output_frames_max();
        Ok(Self {
            inner,
            channels,
            nominal_ratio: ratio,
            rratio: 1.0,
            chunk: vec![vec![0.0; CHUNK_FRAMES]; channels],
            chunk_filled: 0,
            staged: vec![vec![0.0; staged_max]; channels],
            staged_pos: 0,
            staged_len: 0,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn nominal_ratio(&self) -> f64 {
        self.nominal_ratio
    }

    /// The ratio currently being applied: nominal times the running
    /// adjustment.
    pub fn effective_ratio(&self) -> f64 {
        self.nominal_ratio * self.rratio
    }

    /// Adjust the output/input rate factor on the fly.
    ///
    /// The value is clamped to [0, 4] and then to the window the inner
    /// resampler accepts relative to its nominal ratio.
    pub fn set_rratio(&mut self, rratio: f64) {
        let rratio = clamp_ratio(rratio).clamp(0.25, 4.0);
        if self.inner.set_resample_ratio_relative(rratio, true).is_ok() {
            self.rratio = rratio;
        }
    }

    /// Discard internal state (history, staged frames, running ratio).
    pub fn reset(&mut self) {
        self.inner.reset();
        let _ = self.inner.set_resample_ratio_relative(1.0, false);
        self.rratio = 1.0;
        self.chunk_filled = 0;
        self.staged_pos = 0;
        self.staged_len = 0;
    }

    /// Consume up to `in_frames` frames from `inputs` and produce up to
    /// `out_frames` frames into `outputs[c][out_offset..]`.
    ///
    /// Stops consuming once produced output fills the request and a full
    /// chunk is already staged, so unconsumed input is reported back rather
    /// than buffered without bound.
    pub fn process<I, O>(
        &mut self,
        inputs: &[I],
        in_frames: usize,
        outputs: &mut [O],
        out_offset: usize,
        out_frames: usize,
    ) -> ProcessStatus
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            // drain previously staged output first
            if self.staged_pos < self.staged_len && produced < out_frames {
                let avail = self.staged_len - self.staged_pos;
                let want = (out_frames - produced).min(avail);
                for (staged, out) in self.staged.iter().zip(outputs.iter_mut()) {
                    let dst = &mut out.as_mut()[out_offset + produced..out_offset + produced + want];
                    dst.copy_from_slice(&staged[self.staged_pos..self.staged_pos + want]);
                }
                self.staged_pos += want;
                produced += want;
            }

            // stage caller input into the pending chunk
            let take = (CHUNK_FRAMES - self.chunk_filled).min(in_frames - consumed);
            if take > 0 {
                for (chunk, inp) in self.chunk.iter_mut().zip(inputs.iter()) {
                    let src = &inp.as_ref()[consumed..consumed + take];
                    chunk[self.chunk_filled..self.chunk_filled + take].copy_from_slice(src);
                }
                self.chunk_filled += take;
                consumed += take;
                continue;
            }

            // run the inner resampler only when its output has somewhere to go
            if self.chunk_filled == CHUNK_FRAMES
                && self.staged_pos >= self.staged_len
                && produced < out_frames
            {
                match self
                    .inner
                    .process_into_buffer(&self.chunk, &mut self.staged, None)
                {
                    Ok((_, written)) => {
                        self.chunk_filled = 0;
                        self.staged_pos = 0;
                        self.staged_len = written;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("resampler process failed: {}", e);
                        break;
                    }
                }
            }

            break;
        }

        ProcessStatus { consumed, produced }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(
        rs: &mut RatioResampler,
        input: &[Vec<f32>],
        block: usize,
    ) -> (usize, usize, Vec<Vec<f32>>) {
        let total = input[0].len();
        let channels = input.len();
        let mut collected = vec![Vec::new(); channels];
        let mut consumed_total = 0;
        let mut produced_total = 0;
        let mut out = vec![vec![0.0f32; block * 4]; channels];

        let mut pos = 0;
        while pos < total {
            let n = block.min(total - pos);
            let slice: Vec<Vec<f32>> = input
                .iter()
                .map(|ch| ch[pos..pos + n].to_vec())
                .collect();
            let st = rs.process(&slice, n, &mut out, 0, block * 4);
            assert_eq!(st.consumed, n, "small blocks should be fully consumed");
            consumed_total += st.consumed;
            produced_total += st.produced;
            for c in 0..channels {
                collected[c].extend_from_slice(&out[c][..st.produced]);
            }
            pos += n;
        }
        (consumed_total, produced_total, collected)
    }

    #[test]
    fn unity_ratio_preserves_signal() {
        let mut rs = RatioResampler::new(1.0, 1, 8).unwrap();
        let n = 16384;
        let freq = 997.0 / 48000.0;
        let input: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32).sin())
            .collect();

        let (consumed, produced, out) = drive(&mut rs, &[input], 64);
        assert_eq!(consumed, n);

        // the sinc tail delays output; everything else must come through
        let delay_allowance = 8 * 32 + 2 * CHUNK_FRAMES;
        assert!(produced > n - delay_allowance, "produced {produced}");
        assert!(produced <= n + CHUNK_FRAMES);

        // steady-state amplitude of the sine must be preserved
        let steady = &out[0][produced / 2..produced / 2 + 2048];
        let peak = steady.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!((0.9..=1.1).contains(&peak), "peak {peak}");
    }

    #[test]
    fn ratio_sets_cumulative_frame_counts() {
        let ratio = 48000.0 / 44100.0;
        let mut rs = RatioResampler::new(ratio, 2, 8).unwrap();
        let n = 44100;
        let input = vec![vec![0.25f32; n]; 2];

        let (consumed, produced, _) = drive(&mut rs, &input, 441);
        assert_eq!(consumed, n);

        let expected = (n as f64 * ratio) as usize;
        let delay_allowance = (8 * 32 + 2 * CHUNK_FRAMES) * 2;
        assert!(
            produced > expected - delay_allowance && produced <= expected + CHUNK_FRAMES,
            "produced {produced}, expected about {expected}"
        );
    }

    #[test]
    fn leftover_reported_when_output_is_full() {
        let mut rs = RatioResampler::new(1.0, 1, 8).unwrap();
        let input = vec![vec![0.5f32; 256]];
        let mut out = vec![vec![0.0f32; 8]];

        // tiny output space: the wrapper must stop consuming rather than
        // buffer without bound
        let st = rs.process(&input, 256, &mut out, 0, 8);
        assert!(st.consumed < 256, "consumed {}", st.consumed);
        assert!(st.produced <= 8);
    }

    #[test]
    fn rratio_is_clamped_and_applied() {
        let mut rs = RatioResampler::new(1.0, 1, 8).unwrap();
        rs.set_rratio(10.0);
        assert!((rs.effective_ratio() - 4.0).abs() < 1e-12);
        rs.set_rratio(-3.0);
        assert!((rs.effective_ratio() - 0.25).abs() < 1e-12);
        rs.set_rratio(1.05);
        assert!((rs.effective_ratio() - 1.05).abs() < 1e-12);
    }

    #[test]
    fn reset_clears_running_ratio_and_staging() {
        let mut rs = RatioResampler::new(1.0, 1, 8).unwrap();
        rs.set_rratio(1.1);
        let input = vec![vec![0.5f32; 100]];
        let mut out = vec![vec![0.0f32; 400]];
        rs.process(&input, 100, &mut out, 0, 400);

        rs.reset();
        assert!((rs.effective_ratio() - 1.0).abs() < 1e-12);

        // after reset the first output must come from fresh input only
        let silence = vec![vec![0.0f32; 512]];
        let st = rs.process(&silence, 512, &mut out, 0, 400);
        for v in &out[0][..st.produced] {
            assert!(v.abs() < 1e-3, "stale sample {v}");
        }
    }
}
