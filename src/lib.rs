//! Bridge PCM audio between a host real-time audio graph and an external
//! sound card or kernel-exported audio endpoint.
//!
//! The core is a pair of cooperating data paths (capture: device to host,
//! playback: host to device) that cross the real-time boundary between two
//! independently clocked audio loops without ever blocking the host
//! callback. Clock drift is compensated with adaptive resampling on the
//! asynchronous path and a PPM slew hint on the synchronous kernel-region
//! path; block sizes, sample formats and channel counts are matched in
//! between.

pub mod audio;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;

pub use bridge::{Bridge, BridgeDevice, BridgeMonitor, MonitorSnapshot};
pub use config::BridgeConfig;
pub use device::{DeviceConfig, DeviceState, HardwareConfig};
pub use error::BridgeError;
