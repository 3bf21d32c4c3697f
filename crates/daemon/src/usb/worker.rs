//! USB worker thread
//!
//! Runs the libusb event loop and forwards hotplug events into the Tokio
//! runtime. Registration happens on the thread itself; its outcome is reported
//! back before [`spawn_hotplug_worker`] returns, so a daemon that cannot watch
//! the bus never finishes starting.

use crate::usb::manager::HotplugWatcher;
use common::HotplugSource;
use rusb::UsbContext;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Event loop state owned by the worker thread
pub struct HotplugWorker {
    watcher: HotplugWatcher,
    shutdown: CancellationToken,
}

impl HotplugWorker {
    pub fn new(watcher: HotplugWatcher, shutdown: CancellationToken) -> Self {
        Self { watcher, shutdown }
    }

    /// Handle libusb events until shutdown or until the bridge closes
    pub fn run(mut self) {
        info!("USB hotplug worker started");

        while !self.shutdown.is_cancelled() {
            match self.watcher.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            if let Err(e) = self.watcher.process_pending() {
                error!("Hotplug bridge closed: {}", e);
                break;
            }
        }

        info!("USB hotplug worker stopped");
    }
}

/// Start watching for `vendor_id` on a thread named `usb-hotplug`
///
/// Blocks until the hotplug callback is registered or registration failed.
pub fn spawn_hotplug_worker(
    vendor_id: u16,
    source: HotplugSource,
    shutdown: CancellationToken,
) -> common::Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), rusb::Error>>(1);

    let handle = std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || match HotplugWatcher::new(vendor_id, source) {
            Ok(watcher) => {
                let _ = ready_tx.send(Ok(()));
                HotplugWorker::new(watcher, shutdown).run();
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(common::Error::Usb(format!(
                "failed to register hotplug callback: {}",
                e
            )))
        }
        Err(_) => {
            let _ = handle.join();
            Err(common::Error::Usb(
                "hotplug worker exited during startup".to_string(),
            ))
        }
    }
}
