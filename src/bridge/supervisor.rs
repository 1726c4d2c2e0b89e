use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::bridge::device::BridgeDevice;
use crate::config::BridgeConfig;
use crate::device::DeviceConfig;
use crate::error::BridgeError;

enum Request {
    /// Try to open the configured device and hand it back.
    Reopen,
    /// Dispose of a dead device off the audio thread (closing joins the
    /// device worker).
    Release(Box<BridgeDevice>),
}

/// Non-real-time companion thread that opens and releases devices so the
/// audio callback never has to.
///
/// The audio side only ever calls `try_*`: requests and devices travel over
/// bounded channels, and a full channel simply means the request is retried
/// on a later cycle.
pub struct Supervisor {
    requests: Option<Sender<Request>>,
    devices: Receiver<Box<BridgeDevice>>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn(
        config: DeviceConfig,
        knobs: BridgeConfig,
        enabled: bool,
    ) -> Result<Self, BridgeError> {
        let (req_tx, req_rx) = bounded::<Request>(8);
        let (dev_tx, dev_rx) = bounded::<Box<BridgeDevice>>(1);

        let handle = std::thread::Builder::new()
            .name("sndbridge-supervisor".to_string())
            .spawn(move || {
                while let Ok(request) = req_rx.recv() {
                    match request {
                        Request::Reopen => match BridgeDevice::init(config.clone(), &knobs, enabled)
                        {
                            Ok(device) => {
                                if dev_tx.try_send(Box::new(device)).is_err() {
                                    // a device is already waiting for pickup
                                }
                            }
                            Err(e) => {
                                // expected while the device is absent; the
                                // bridge paces retries at one per second
                                tracing::debug!("device open failed: {}", e);
                            }
                        },
                        Request::Release(device) => drop(device),
                    }
                }
                tracing::debug!("supervisor exit");
            })?;

        Ok(Self {
            requests: Some(req_tx),
            devices: dev_rx,
            handle: Some(handle),
        })
    }

    /// Ask for a fresh device; non-blocking, safe from the audio thread.
    pub fn request_reopen(&self) {
        if let Some(tx) = &self.requests {
            let _ = tx.try_send(Request::Reopen);
        }
    }

    /// Hand a dead device over for release; non-blocking, safe from the
    /// audio thread.
    pub fn release(&self, device: Box<BridgeDevice>) {
        if let Some(tx) = &self.requests {
            if let Err(e) = tx.try_send(Request::Release(device)) {
                // supervisor gone or jammed; drop inline as a last resort
                tracing::warn!("releasing device inline: {}", e);
            }
        }
    }

    /// Pick up a device opened since the last call, if any.
    pub fn try_take(&self) -> Option<Box<BridgeDevice>> {
        self.devices.try_recv().ok()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // closing the request channel ends the thread's recv loop
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
