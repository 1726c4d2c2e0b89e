pub mod format;
pub mod resampler;
pub mod ring;
pub mod smoother;

pub use format::SampleFormat;
pub use resampler::{clamp_ratio, ProcessStatus, RatioResampler};
pub use ring::AudioRingBuffer;
pub use smoother::GainSmoother;
