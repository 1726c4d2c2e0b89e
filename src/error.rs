use thiserror::Error;

/// Errors surfaced by device open and bridge construction.
///
/// Audio-thread paths never return these; they report liveness as a bool and
/// degrade to silence, with the shell scheduling a re-open.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid device identifier {0:?}")]
    InvalidDeviceId(String),

    #[error("failed to open PCM device {device}: {source}")]
    PcmOpen {
        device: String,
        #[source]
        source: alsa::Error,
    },

    #[error("no supported sample format on {device}")]
    NoSupportedFormat { device: String },

    #[error("no supported sample rate on {device}")]
    NoSupportedRate { device: String },

    #[error("no usable period/buffer geometry on {device}")]
    NoBufferGeometry { device: String },

    #[error("PCM parameter setup failed: {0}")]
    PcmParams(#[from] alsa::Error),

    #[error("failed to start device worker thread: {0}")]
    Worker(#[from] std::io::Error),

    #[error("failed to open shared audio region {path}: {source}")]
    ShmOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shared audio region {path} is not active on the kernel side")]
    ShmInactive { path: String },

    #[error("shared audio region {path} rejected: {detail}")]
    ShmGeometry { path: String, detail: String },

    #[error("resampler setup failed: {0}")]
    Resampler(String),
}
